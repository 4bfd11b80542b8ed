//! Command parsing and verb dispatch

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    Helo(String),
    Mail { from: String, size: Option<usize> },
    Rcpt(String),
    Data,
    StartTls,
    Rset,
    Noop,
    Vrfy,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The verb is not one we serve.
    Unknown,
    /// Known verb, unusable arguments.
    Syntax,
}

impl Command {
    /// Parses one command line (without its line terminator). Verbs are
    /// case-insensitive.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let (verb, args) = match line.split_once(char::is_whitespace) {
            Some((verb, args)) => (verb, args.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "EHLO" => Ok(Self::Ehlo(client_name(args))),
            "HELO" => Ok(Self::Helo(client_name(args))),
            "MAIL" => {
                let (from, params) = parse_path(args, "FROM:")?;
                let size = mail_size(params)?;
                Ok(Self::Mail { from, size })
            }
            "RCPT" => {
                let (to, _) = parse_path(args, "TO:")?;
                if to.is_empty() {
                    return Err(ParseError::Syntax);
                }
                Ok(Self::Rcpt(to))
            }
            "DATA" => Ok(Self::Data),
            "STARTTLS" => Ok(Self::StartTls),
            "RSET" => Ok(Self::Rset),
            "NOOP" => Ok(Self::Noop),
            "VRFY" => Ok(Self::Vrfy),
            "QUIT" => Ok(Self::Quit),
            _ => Err(ParseError::Unknown),
        }
    }
}

fn client_name(args: &str) -> String {
    args.split_whitespace()
        .next()
        .unwrap_or("unknown")
        .to_string()
}

/// Splits `FROM:<addr> PARAMS` into the bare address and the parameter text.
fn parse_path<'a>(args: &'a str, prefix: &str) -> Result<(String, &'a str), ParseError> {
    let matches = args
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
    if !matches {
        return Err(ParseError::Syntax);
    }

    let rest = args[prefix.len()..].trim_start();
    if rest.is_empty() {
        return Err(ParseError::Syntax);
    }

    let end = if rest.starts_with('<') {
        rest.find('>').map_or(rest.len(), |i| i + 1)
    } else {
        rest.find(char::is_whitespace).unwrap_or(rest.len())
    };
    let (path, params) = rest.split_at(end);
    let address = path.trim_matches(|c| c == '<' || c == '>').to_string();
    Ok((address, params.trim()))
}

fn mail_size(params: &str) -> Result<Option<usize>, ParseError> {
    for param in params.split_whitespace() {
        if let Some((key, value)) = param.split_once('=') {
            if key.eq_ignore_ascii_case("SIZE") {
                return value.parse().map(Some).map_err(|_| ParseError::Syntax);
            }
        }
    }
    Ok(None)
}
