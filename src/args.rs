//! Emulator argument list and command-line serialization.
//!
//! The argument vector is always `[qemu, "-bios", firmware, extra...]`.
//! Spawn interfaces that take a single command-line string (Windows
//! `CreateProcess`) get it through [`ArgumentList::to_command_line`], which
//! quotes tokens so that the child's `CommandLineToArgvW` parse returns the
//! exact same vector.

use std::borrow::Cow;

/// Flag that introduces the firmware image.
pub const BIOS_FLAG: &str = "-bios";

/// Characters that force a token to be quoted.
const QUOTE_TRIGGERS: &[char] = &[
    ' ', '\t', '\n', '\x0b', '"', '&', '|', '<', '>', '^', '(', ')', '%', '!',
];

/// Ordered emulator argument vector, program first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentList {
    tokens: Vec<String>,
}

impl ArgumentList {
    /// Assemble the argument vector.
    ///
    /// The `-bios` pair is emitted only when `bios` is non-empty.
    pub fn build(qemu: &str, bios: &str, extra: &[String]) -> Self {
        let mut tokens = Vec::with_capacity(3 + extra.len());
        tokens.push(qemu.to_string());
        if !bios.is_empty() {
            tokens.push(BIOS_FLAG.to_string());
            tokens.push(bios.to_string());
        }
        tokens.extend(extra.iter().cloned());
        Self { tokens }
    }

    /// Append tokens after everything already present.
    pub fn push<S: Into<String>>(&mut self, token: S) {
        self.tokens.push(token.into());
    }

    pub fn program(&self) -> &str {
        &self.tokens[0]
    }

    /// Everything after the program token.
    pub fn args(&self) -> &[String] {
        &self.tokens[1..]
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Single-string form for spawn interfaces without an argv vector.
    pub fn to_command_line(&self) -> String {
        let mut line = quote_program(self.program()).into_owned();
        for arg in self.args() {
            line.push(' ');
            line.push_str(&quote_arg(arg));
        }
        line
    }
}

/// Quote the program token. `argv[0]` is split on the first whitespace
/// outside quotes with no backslash processing, so it only needs wrapping.
pub fn quote_program(program: &str) -> Cow<'_, str> {
    if program.is_empty() || program.contains(QUOTE_TRIGGERS) {
        Cow::Owned(format!("\"{program}\""))
    } else {
        Cow::Borrowed(program)
    }
}

/// Quote one argument for `CommandLineToArgvW`.
///
/// Backslashes are literal unless they precede a double quote; a run of `n`
/// backslashes before a quote becomes `2n + 1` backslashes plus the quote,
/// and a run before the closing quote becomes `2n`.
pub fn quote_arg(arg: &str) -> Cow<'_, str> {
    if !arg.is_empty() && !arg.contains(QUOTE_TRIGGERS) {
        return Cow::Borrowed(arg);
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0usize;
    for ch in arg.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(std::iter::repeat_n('\\', backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            _ => {
                quoted.extend(std::iter::repeat_n('\\', backslashes));
                quoted.push(ch);
                backslashes = 0;
            }
        }
    }
    quoted.extend(std::iter::repeat_n('\\', backslashes * 2));
    quoted.push('"');
    Cow::Owned(quoted)
}

/// Split a command line the way `CommandLineToArgvW` does.
///
/// Used to check [`ArgumentList::to_command_line`] and to render the
/// effective argv in diagnostics.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    // Program name: quotes toggle, no escapes.
    let mut program = String::new();
    let mut in_quotes = false;
    while let Some(&ch) = chars.peek() {
        if ch == '"' {
            in_quotes = !in_quotes;
        } else if !in_quotes && (ch == ' ' || ch == '\t') {
            break;
        } else {
            program.push(ch);
        }
        chars.next();
    }
    tokens.push(program);

    loop {
        while matches!(chars.peek(), Some(' ' | '\t')) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut token = String::new();
        let mut in_quotes = false;
        while let Some(&ch) = chars.peek() {
            match ch {
                '\\' => {
                    let mut run = 0usize;
                    while chars.peek() == Some(&'\\') {
                        run += 1;
                        chars.next();
                    }
                    if chars.peek() == Some(&'"') {
                        token.extend(std::iter::repeat_n('\\', run / 2));
                        if run % 2 == 1 {
                            token.push('"');
                            chars.next();
                        }
                    } else {
                        token.extend(std::iter::repeat_n('\\', run));
                    }
                }
                '"' => {
                    chars.next();
                    // `""` inside a quoted span is a literal quote.
                    if in_quotes && chars.peek() == Some(&'"') {
                        token.push('"');
                        chars.next();
                    } else {
                        in_quotes = !in_quotes;
                    }
                }
                ' ' | '\t' if !in_quotes => break,
                _ => {
                    token.push(ch);
                    chars.next();
                }
            }
        }
        tokens.push(token);
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extra(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bios_pair_follows_program() {
        let list = ArgumentList::build("/usr/bin/qemu-system-avr", "/fw/avr.bin", &extra(&["-nographic"]));
        assert_eq!(
            list.tokens(),
            ["/usr/bin/qemu-system-avr", "-bios", "/fw/avr.bin", "-nographic"]
        );
    }

    #[test]
    fn empty_bios_omits_flag() {
        let list = ArgumentList::build("qemu", "", &extra(&["-m", "2048"]));
        assert_eq!(list.tokens(), ["qemu", "-m", "2048"]);
    }

    #[test]
    fn duplicate_arguments_are_kept_in_order() {
        let list = ArgumentList::build("qemu", "bios.bin", &extra(&["-s", "-s", "-S"]));
        assert_eq!(list.args(), ["-bios", "bios.bin", "-s", "-s", "-S"]);
    }

    #[test]
    fn plain_tokens_are_not_quoted() {
        assert_eq!(quote_arg("-nographic"), "-nographic");
        assert_eq!(quote_arg(r"C:\fw\bios.bin"), r"C:\fw\bios.bin");
    }

    #[test]
    fn quoting_examples() {
        assert_eq!(quote_arg(""), "\"\"");
        assert_eq!(quote_arg("-m 2048"), "\"-m 2048\"");
        assert_eq!(quote_arg(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(quote_arg(r"C:\Program Files\"), r#""C:\Program Files\\""#);
        assert_eq!(quote_arg("a&b"), "\"a&b\"");
    }

    #[test]
    fn program_with_spaces_is_wrapped() {
        let list = ArgumentList::build(r"C:\Program Files\qemu\qemu-system-x86_64.exe", r"C:\fw\bios.bin", &[]);
        assert_eq!(
            list.to_command_line(),
            r#""C:\Program Files\qemu\qemu-system-x86_64.exe" -bios C:\fw\bios.bin"#
        );
    }

    #[test]
    fn command_line_splits_back_into_tokens() {
        let list = ArgumentList::build(
            r"C:\Program Files\qemu\qemu-system-arm.exe",
            r"C:\My Firmware\bios.bin",
            &extra(&["-m 2048", "", r#"tricky\"quote"#, r"trailing\", "-append", "console=ttyS0 rw"]),
        );
        assert_eq!(split_command_line(&list.to_command_line()), list.tokens());
    }
}
