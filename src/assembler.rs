//! Assembler for textual IL, the inverse of the instruction listing.
//!
//! Accepts one instruction per line, optionally preceded by labels
//! (`loop:`) or listing prefixes (`IL_0012:`). Branch operands name a label
//! or an absolute offset; member operands are raw tokens written `@0x0A000001`;
//! string literals are interned into a user-string table.
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use byteorder::{LittleEndian, WriteBytesExt};
use regex::Regex;

use crate::bytecode::{OPCode, OperandKind};
use crate::error::AssembleError;
use crate::module::Token;

/// First user-string token handed out.
pub const FIRST_STRING_TOKEN: u32 = 0x7000_0001;

static LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_$]*)\s*:(.*)$").expect("valid regex"));

type Result<T> = std::result::Result<T, AssembleError>;

struct Line<'a> {
    number: usize,
    opcode: OPCode,
    operand: &'a str,
    offset: u32,
}

/// Assembles method bodies, sharing one string table across them.
#[derive(Debug, Clone)]
pub struct Assembler {
    strings: BTreeMap<Token, String>,
    next_string: u32,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            strings: BTreeMap::new(),
            next_string: FIRST_STRING_TOKEN,
        }
    }

    /// Literals interned so far.
    pub fn strings(&self) -> &BTreeMap<Token, String> {
        &self.strings
    }

    pub fn into_strings(self) -> BTreeMap<Token, String> {
        self.strings
    }

    pub fn assemble(&mut self, text: &str) -> Result<Vec<u8>> {
        let mut labels = HashMap::new();
        let mut lines = Vec::new();
        let mut offset = 0u32;

        for (index, raw) in text.lines().enumerate() {
            let number = index + 1;
            let mut rest = strip_comment(raw).trim();
            while let Some(caps) = LABEL.captures(rest) {
                let name = caps.get(1).map_or("", |m| m.as_str());
                if labels.insert(name.to_string(), offset).is_some() && !name.starts_with("IL_") {
                    return Err(error(number, format!("label `{name}` defined twice")));
                }
                rest = caps.get(2).map_or("", |m| m.as_str()).trim();
            }
            if rest.is_empty() {
                continue;
            }
            let (mnemonic, operand) = match rest.split_once(char::is_whitespace) {
                Some((m, o)) => (m, o.trim()),
                None => (rest, ""),
            };
            let opcode = OPCode::from_mnemonic(mnemonic)
                .ok_or_else(|| error(number, format!("unknown mnemonic `{mnemonic}`")))?;
            let width = match opcode.operand_kind().width() {
                Some(width) => width,
                None => 4 + 4 * split_list(operand, number)?.len(),
            };
            lines.push(Line {
                number,
                opcode,
                operand,
                offset,
            });
            offset += (opcode.size() + width) as u32;
        }

        let mut code = Vec::with_capacity(offset as usize);
        for line in &lines {
            code.extend(line.opcode.encode());
            self.emit_operand(&mut code, line, &labels)?;
        }
        Ok(code)
    }

    fn emit_operand(
        &mut self,
        code: &mut Vec<u8>,
        line: &Line,
        labels: &HashMap<String, u32>,
    ) -> Result<()> {
        let number = line.number;
        let kind = line.opcode.operand_kind();
        if kind == OperandKind::InlineNone {
            if !line.operand.is_empty() {
                return Err(error(number, format!("{} takes no operand", line.opcode)));
            }
            return Ok(());
        }
        if line.operand.is_empty() {
            return Err(error(number, format!("{} needs an operand", line.opcode)));
        }
        let text = line.operand;
        let end = line.offset + (line.opcode.size() + kind.width().unwrap_or(0)) as u32;
        match kind {
            OperandKind::InlineNone => {}
            OperandKind::ShortInlineVar => code.push(ranged::<u8>(text, number)?),
            OperandKind::InlineVar => {
                write(code.write_u16::<LittleEndian>(ranged(text, number)?))
            }
            OperandKind::ShortInlineI => code.push(ranged::<i8>(text, number)? as u8),
            OperandKind::InlineI => write(code.write_i32::<LittleEndian>(int32(text, number)?)),
            OperandKind::InlineI8 => {
                write(code.write_i64::<LittleEndian>(ranged(text, number)?))
            }
            OperandKind::ShortInlineR => {
                write(code.write_f32::<LittleEndian>(float(text, number)? as f32))
            }
            OperandKind::InlineR => write(code.write_f64::<LittleEndian>(float(text, number)?)),
            OperandKind::ShortInlineBrTarget => {
                let relative = target(text, labels, number)? - end as i64;
                let relative = i8::try_from(relative).map_err(|_| {
                    error(number, format!("branch to `{text}` is out of short range"))
                })?;
                code.push(relative as u8);
            }
            OperandKind::InlineBrTarget => {
                let relative = target(text, labels, number)? - end as i64;
                write(code.write_i32::<LittleEndian>(relative as i32));
            }
            OperandKind::InlineSwitch => {
                let targets = split_list(text, number)?;
                let end = line.offset + (line.opcode.size() + 4 + 4 * targets.len()) as u32;
                write(code.write_u32::<LittleEndian>(targets.len() as u32));
                for t in targets {
                    let relative = target(t, labels, number)? - end as i64;
                    write(code.write_i32::<LittleEndian>(relative as i32));
                }
            }
            OperandKind::InlineString if text.starts_with('"') => {
                let literal = unescape(text, number)?;
                let token = self.intern(literal);
                write(code.write_u32::<LittleEndian>(token));
            }
            OperandKind::InlineString
            | OperandKind::InlineField
            | OperandKind::InlineMethod
            | OperandKind::InlineType
            | OperandKind::InlineTok
            | OperandKind::InlineSig => {
                let token = text
                    .strip_prefix('@')
                    .and_then(Token::parse)
                    .ok_or_else(|| {
                        let message =
                            format!("expected a token such as @0x0A000001, found `{text}`");
                        error(number, message)
                    })?;
                write(code.write_u32::<LittleEndian>(token.0));
            }
        }
        Ok(())
    }

    fn intern(&mut self, literal: String) -> u32 {
        if let Some((token, _)) = self.strings.iter().find(|(_, s)| **s == literal) {
            return token.0;
        }
        let token = self.next_string;
        self.next_string += 1;
        self.strings.insert(Token(token), literal);
        token
    }
}

/// Assembles a single body with its own string table.
pub fn assemble(text: &str) -> Result<(Vec<u8>, BTreeMap<Token, String>)> {
    let mut assembler = Assembler::new();
    let code = assembler.assemble(text)?;
    Ok((code, assembler.into_strings()))
}

// Writing into a Vec cannot fail.
fn write(result: std::io::Result<()>) {
    debug_assert!(result.is_ok());
}

fn error(line: usize, message: String) -> AssembleError {
    AssembleError { line, message }
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '/' if !in_string && line[i..].starts_with("//") => return &line[..i],
            _ => {}
        }
    }
    line
}

fn integer(text: &str, line: usize) -> Result<i128> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i128::from_str_radix(hex, 16),
        None => digits.parse::<i128>(),
    }
    .map_err(|_| error(line, format!("`{text}` is not an integer")))?;
    Ok(if negative { -value } else { value })
}

fn ranged<T: TryFrom<i128>>(text: &str, line: usize) -> Result<T> {
    T::try_from(integer(text, line)?).map_err(|_| error(line, format!("`{text}` is out of range")))
}

/// 32-bit operand; hexadecimal bit patterns above `i32::MAX` wrap.
fn int32(text: &str, line: usize) -> Result<i32> {
    let value = integer(text, line)?;
    i32::try_from(value)
        .or_else(|_| u32::try_from(value).map(|v| v as i32))
        .map_err(|_| error(line, format!("`{text}` is out of range")))
}

fn float(text: &str, line: usize) -> Result<f64> {
    text.parse()
        .map_err(|_| error(line, format!("`{text}` is not a number")))
}

fn target(text: &str, labels: &HashMap<String, u32>, line: usize) -> Result<i64> {
    match labels.get(text) {
        Some(&offset) => Ok(offset as i64),
        None => ranged::<u32>(text, line)
            .map(i64::from)
            .map_err(|_| error(line, format!("unknown label `{text}`"))),
    }
}

fn split_list(text: &str, line: usize) -> Result<Vec<&str>> {
    let inner = text
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(|| error(line, format!("expected `(target, ...)`, found `{text}`")))?;
    Ok(inner
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect())
}

fn unescape(text: &str, line: usize) -> Result<String> {
    let inner = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .ok_or_else(|| error(line, format!("unterminated string {text}")))?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        out.push(match chars.next() {
            Some('r') => '\r',
            Some('n') => '\n',
            Some('t') => '\t',
            Some('0') => '\0',
            Some('"') => '"',
            Some('\\') => '\\',
            other => {
                return Err(error(line, format!("bad escape `\\{}`", other.unwrap_or(' '))))
            }
        });
    }
    Ok(out)
}
