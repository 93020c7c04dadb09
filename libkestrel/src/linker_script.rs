//! A parser for the subset of GNU ld scripts that toolchains ship as library stand-ins,
//! e.g. `libc.so` being a text file saying `GROUP ( libc.so.6 libc_nonshared.a ... )`. The
//! parser only extracts the commands we act on; everything else is skipped structurally.

use crate::error::Result;
use anyhow::bail;

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ScriptCommands {
    pub(crate) inputs: Vec<ScriptInput>,
    pub(crate) entry: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ScriptInput {
    pub(crate) name: String,

    /// Set inside an `AS_NEEDED ( ... )` block, overriding the surrounding state.
    pub(crate) as_needed: Option<bool>,
}

struct Tokenizer<'a> {
    text: &'a str,
}

impl<'a> Tokenizer<'a> {
    fn new(text: &'a str) -> Self {
        Self { text }
    }

    fn skip_ignored(&mut self) {
        loop {
            let trimmed = self.text.trim_start();
            if let Some(rest) = trimmed.strip_prefix("/*") {
                match rest.find("*/") {
                    Some(end) => self.text = &rest[end + 2..],
                    None => self.text = "",
                }
            } else {
                self.text = trimmed;
                return;
            }
        }
    }

    fn next(&mut self) -> Option<&'a str> {
        self.skip_ignored();
        if self.text.is_empty() {
            return None;
        }
        let bytes = self.text.as_bytes();
        if matches!(bytes[0], b'(' | b')' | b',' | b';' | b'=') {
            let (token, rest) = self.text.split_at(1);
            self.text = rest;
            return Some(token);
        }
        if bytes[0] == b'"' {
            let rest = &self.text[1..];
            let end = rest.find('"').unwrap_or(rest.len());
            let token = &rest[..end];
            self.text = &rest[(end + 1).min(rest.len())..];
            return Some(token);
        }
        let end = self
            .text
            .find(|c: char| c.is_whitespace() || "(),;=".contains(c))
            .unwrap_or(self.text.len());
        let (token, rest) = self.text.split_at(end);
        self.text = rest;
        Some(token)
    }
}

pub(crate) fn parse_script(text: &str) -> Result<ScriptCommands> {
    let mut tokens = Tokenizer::new(text);
    let mut commands = ScriptCommands::default();
    let mut saw_command = false;

    while let Some(token) = tokens.next() {
        match token {
            "GROUP" | "INPUT" => {
                saw_command = true;
                parse_input_list(&mut tokens, &mut commands.inputs, None)?;
            }
            "ENTRY" => {
                saw_command = true;
                expect(&mut tokens, "(")?;
                if let Some(symbol) = tokens.next() {
                    if symbol != ")" {
                        commands.entry = Some(symbol.to_owned());
                        expect(&mut tokens, ")")?;
                    }
                }
            }
            "OUTPUT_FORMAT" | "OUTPUT_ARCH" | "TARGET" | "SEARCH_DIR" | "OUTPUT" => {
                saw_command = true;
                skip_parenthesised(&mut tokens)?;
            }
            ";" => {}
            _ => bail!("unsupported linker script command `{token}`"),
        }
    }

    if !saw_command {
        bail!("file contains no linker script commands");
    }
    Ok(commands)
}

fn parse_input_list(
    tokens: &mut Tokenizer,
    inputs: &mut Vec<ScriptInput>,
    as_needed: Option<bool>,
) -> Result {
    expect(tokens, "(")?;
    loop {
        let Some(token) = tokens.next() else {
            bail!("unterminated input list in linker script");
        };
        match token {
            ")" => return Ok(()),
            "," => {}
            "AS_NEEDED" => parse_input_list(tokens, inputs, Some(true))?,
            name => inputs.push(ScriptInput {
                name: name.to_owned(),
                as_needed,
            }),
        }
    }
}

fn skip_parenthesised(tokens: &mut Tokenizer) -> Result {
    expect(tokens, "(")?;
    let mut depth = 1;
    while depth > 0 {
        match tokens.next() {
            Some("(") => depth += 1,
            Some(")") => depth -= 1,
            Some(_) => {}
            None => bail!("unterminated parenthesis in linker script"),
        }
    }
    Ok(())
}

fn expect(tokens: &mut Tokenizer, expected: &str) -> Result {
    match tokens.next() {
        Some(t) if t == expected => Ok(()),
        other => bail!("expected `{expected}` in linker script, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glibc_style_group() {
        let commands = parse_script(
            "/* GNU ld script */\nOUTPUT_FORMAT(elf64-x86-64)\nGROUP ( /lib/libc.so.6 /usr/lib/libc_nonshared.a  AS_NEEDED ( /lib64/ld-linux-x86-64.so.2 ) )\n",
        )
        .unwrap();
        assert_eq!(
            commands.inputs,
            vec![
                ScriptInput {
                    name: "/lib/libc.so.6".to_owned(),
                    as_needed: None,
                },
                ScriptInput {
                    name: "/usr/lib/libc_nonshared.a".to_owned(),
                    as_needed: None,
                },
                ScriptInput {
                    name: "/lib64/ld-linux-x86-64.so.2".to_owned(),
                    as_needed: Some(true),
                },
            ]
        );
    }

    #[test]
    fn test_input_with_libs_and_entry() {
        let commands = parse_script("INPUT(-lfoo, bar.o)\nENTRY(my_start)").unwrap();
        assert_eq!(commands.inputs.len(), 2);
        assert_eq!(commands.inputs[0].name, "-lfoo");
        assert_eq!(commands.entry.as_deref(), Some("my_start"));
    }

    #[test]
    fn test_not_a_script() {
        assert!(parse_script("just some random words").is_err());
        assert!(parse_script("").is_err());
    }
}
