// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Quote-aware command-line splitting. See [`parse_command_arguments`].

/// Malformed quoting in a command line.
#[derive(Debug, thiserror::Error, miette::Diagnostic, PartialEq, Eq)]
pub enum CommandLineError {
    #[error("unterminated {0} quote")]
    #[diagnostic(code(biodispatch::subprocess::unterminated_quote))]
    UnterminatedQuote(char),

    #[error("trailing backslash")]
    #[diagnostic(code(biodispatch::subprocess::trailing_backslash))]
    TrailingBackslash,
}

/// Splits a command line into an argument vector on unquoted whitespace.
///
/// Quoting follows the common shell subset - and nothing more: no variable
/// expansion, no globbing, no command substitution.
///
/// - `'...'` preserves everything literally (including backslashes),
/// - `"..."` preserves whitespace; `\` escapes the next character,
/// - unquoted `\` escapes the next character,
/// - adjacent quoted/unquoted pieces concatenate into one argument
///   (`a"b c"d` is `ab cd`).
///
/// # Errors
///
/// [`CommandLineError`] on an unterminated quote or trailing backslash.
///
/// # Examples
///
/// ```
/// use biodispatch::parse_command_arguments;
///
/// let argv = parse_command_arguments("grep -F 'a b' file.txt")?;
/// assert_eq!(argv, ["grep", "-F", "a b", "file.txt"]);
/// # Ok::<(), biodispatch::CommandLineError>(())
/// ```
pub fn parse_command_arguments(
    command_line: &str,
) -> Result<Vec<String>, CommandLineError> {
    let mut arguments = Vec::new();
    let mut current = String::new();
    // Distinguishes an empty pending argument (`''`) from no pending argument.
    let mut has_pending = false;
    let mut chars = command_line.chars();

    while let Some(ch) = chars.next() {
        match ch {
            c if c.is_whitespace() => {
                if has_pending {
                    arguments.push(std::mem::take(&mut current));
                    has_pending = false;
                }
            }
            '\'' => {
                has_pending = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => return Err(CommandLineError::UnterminatedQuote('\'')),
                    }
                }
            }
            '"' => {
                has_pending = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => {
                                return Err(CommandLineError::UnterminatedQuote('"'));
                            }
                        },
                        Some(inner) => current.push(inner),
                        None => return Err(CommandLineError::UnterminatedQuote('"')),
                    }
                }
            }
            '\\' => {
                has_pending = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return Err(CommandLineError::TrailingBackslash),
                }
            }
            other => {
                has_pending = true;
                current.push(other);
            }
        }
    }

    if has_pending {
        arguments.push(current);
    }
    Ok(arguments)
}
