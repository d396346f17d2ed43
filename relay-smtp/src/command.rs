use core::fmt::{self, Display, Formatter};

use empath_common::address::{Address, AddressList};
pub use empath_common::envelope::{BodyType, MailParameters};
use mailparse::MailAddr;

#[derive(PartialEq, PartialOrd, Eq, Hash, Debug)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

/// SASL mechanism requested by an `AUTH` command.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AuthMechanism {
    Plain,
    Login,
}

impl Display for AuthMechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        })
    }
}

#[derive(Eq, PartialEq, Debug)]
pub enum Command {
    Helo(HeloVariant),
    Help,
    /// If the address is `None`, this is the `null sender`, or `null
    /// reverse-path`, per [RFC 5321](https://www.ietf.org/rfc/rfc5321.txt).
    MailFrom(Option<Address>, MailParameters),
    RcptTo(AddressList),
    Rset,
    /// `AUTH <mechanism> [initial-response]`
    Auth(AuthMechanism, Option<String>),
    /// A line of SASL challenge-response data sent outside of a recognised
    /// command (e.g. the base64 username/password following `AUTH LOGIN`).
    AuthContinuation(String),
    Data,
    Quit,
    StartTLS,
    Noop,
    Invalid(String),
    /// `MAIL FROM` whose reverse-path didn't parse as an address.
    InvalidMailFrom(String),
    /// `RCPT TO` whose forward-path didn't parse as an address.
    InvalidRcptTo(String),
}

impl Command {
    #[must_use]
    pub fn inner(&self) -> String {
        match self {
            Self::MailFrom(from, _) => from.as_ref().map_or_else(String::new, |f| match &**f {
                MailAddr::Group(_) => String::new(),
                MailAddr::Single(s) => s.to_string(),
            }),
            Self::RcptTo(to) => to.to_string(),
            Self::Invalid(command)
            | Self::InvalidMailFrom(command)
            | Self::InvalidRcptTo(command) => command.clone(),
            Self::Helo(HeloVariant::Ehlo(id) | HeloVariant::Helo(id)) => id.clone(),
            _ => String::new(),
        }
    }

    /// Extract the SIZE parameter from a MAIL FROM command, if present.
    ///
    /// Per RFC 1870, the SIZE parameter indicates the size (in bytes) of the
    /// message the client intends to transmit.
    #[must_use]
    pub const fn size(&self) -> Option<usize> {
        match self {
            Self::MailFrom(_, params) => params.size,
            _ => None,
        }
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v) => fmt.write_fmt(format_args!("{} {}", v, self.inner())),
            Self::MailFrom(s, params) => {
                let addr = s.as_ref().map_or_else(String::new, |f| match &**f {
                    MailAddr::Group(_) => String::new(),
                    MailAddr::Single(s) => s.to_string(),
                });
                if let Some(size_val) = params.size {
                    fmt.write_fmt(format_args!("MAIL FROM:{addr} SIZE={size_val}"))
                } else {
                    fmt.write_fmt(format_args!("MAIL FROM:{addr}"))
                }
            }
            Self::RcptTo(rcpt) => fmt.write_fmt(format_args!("RCPT TO:{rcpt}")),
            Self::Data => fmt.write_str("DATA"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::StartTLS => fmt.write_str("STARTTLS"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Invalid(s) | Self::InvalidMailFrom(s) | Self::InvalidRcptTo(s) => {
                fmt.write_str(s)
            }
            Self::Help => fmt.write_str("HELP"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Auth(mechanism, _) => fmt.write_fmt(format_args!("AUTH {mechanism}")),
            Self::AuthContinuation(_) => fmt.write_str("<SASL response>"),
        }
    }
}

/// Parse the MAIL FROM parameter tail (everything after the address) into
/// [`MailParameters`], per RFC 1870 (SIZE) and RFC 6152 (BODY), plus the
/// forwarded SASL identity (AUTH=) used by relaying MTAs.
fn parse_mail_parameters(tail: &str) -> Result<MailParameters, String> {
    let params: Vec<&str> = tail.split_whitespace().collect();

    let size_params: Vec<&str> = params
        .iter()
        .filter(|p| p.len() >= 5 && p[..5].eq_ignore_ascii_case("SIZE="))
        .copied()
        .collect();

    if size_params.len() > 1 {
        return Err(String::from("Duplicate SIZE parameter not allowed"));
    }

    let size = size_params.first().and_then(|size_param| {
        size_param.split('=').nth(1).and_then(|s| {
            s.parse::<usize>().ok().and_then(|val| {
                // RFC 1870 Section 4: value zero indicates no fixed maximum,
                // but clients shouldn't declare 0-byte messages.
                if val == 0 { None } else { Some(val) }
            })
        })
    });

    let body = params
        .iter()
        .find(|p| p.len() >= 5 && p[..5].eq_ignore_ascii_case("BODY="))
        .and_then(|param| param.split('=').nth(1))
        .and_then(|value| {
            if value.eq_ignore_ascii_case("7BIT") {
                Some(BodyType::SevenBit)
            } else if value.eq_ignore_ascii_case("8BITMIME") {
                Some(BodyType::EightBitMime)
            } else {
                None
            }
        });

    let auth = params
        .iter()
        .find(|p| p.len() >= 5 && p[..5].eq_ignore_ascii_case("AUTH="))
        .and_then(|param| param.split_once('='))
        .map(|(_, value)| value.to_string())
        .filter(|value| value != "<>");

    Ok(MailParameters { size, body, auth })
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let comm = command.to_ascii_uppercase();
        let comm = comm.trim();

        if comm.starts_with("MAIL FROM:") {
            if comm.len() < 11 {
                return Err(Self::Invalid(command.to_owned()));
            }

            // Format: MAIL FROM:<addr> [SIZE=<size>] [BODY=<type>] [AUTH=<id>]
            let rest = command[10..].trim();
            let parts: Vec<&str> = rest.splitn(2, char::is_whitespace).collect();
            let addr = parts[0];

            let params = if parts.len() > 1 {
                parse_mail_parameters(parts[1]).map_err(Self::Invalid)?
            } else {
                MailParameters::new()
            };

            // Handle NULL sender explicitly, as mailparse doesn't tend to like this
            if addr == "<>" {
                return Ok(Self::MailFrom(None, params));
            }

            mailparse::addrparse(addr).map_or_else(
                |err| Err(Self::InvalidMailFrom(err.to_string())),
                |from| {
                    Ok(Self::MailFrom(
                        if from.is_empty() {
                            None
                        } else {
                            Some(from[0].clone().into())
                        },
                        params,
                    ))
                },
            )
        } else if comm.starts_with("RCPT TO:") {
            if comm.len() < 9 {
                return Err(Self::Invalid(command.to_owned()));
            }

            mailparse::addrparse(command[8..].trim()).map_or_else(
                |e| Err(Self::InvalidRcptTo(e.to_string())),
                |to| Ok(Self::RcptTo(to.into())),
            )
        } else if comm.starts_with("EHLO") || comm.starts_with("HELO") {
            match command.split_once(' ') {
                None => Err(Self::Invalid(format!("Expected hostname in {comm}"))),
                Some((_, host)) if comm.starts_with('H') => {
                    Ok(Self::Helo(HeloVariant::Helo(host.trim().to_string())))
                }
                Some((_, host)) => Ok(Self::Helo(HeloVariant::Ehlo(host.trim().to_string()))),
            }
        } else if comm.starts_with("AUTH") {
            let rest = comm[4..].trim();
            let mut fields = rest.splitn(2, char::is_whitespace);

            match fields.next() {
                Some("PLAIN") => Ok(Self::Auth(
                    AuthMechanism::Plain,
                    fields.next().map(str::to_string),
                )),
                Some("LOGIN") => Ok(Self::Auth(
                    AuthMechanism::Login,
                    fields.next().map(str::to_string),
                )),
                Some("") | None => Err(Self::Invalid(String::from(
                    "AUTH requires a SASL mechanism",
                ))),
                Some(other) => Err(Self::Invalid(format!("Unsupported AUTH mechanism {other}"))),
            }
        } else {
            match comm {
                "DATA" => Ok(Self::Data),
                "QUIT" => Ok(Self::Quit),
                "STARTTLS" => Ok(Self::StartTLS),
                "HELP" => Ok(Self::Help),
                "RSET" => Ok(Self::Rset),
                "NOOP" => Ok(Self::Noop),
                _ => Err(Self::Invalid(command.to_owned())),
            }
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| Err(Self::Invalid("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}

impl TryFrom<String> for Command {
    type Error = Self;

    fn try_from(command: String) -> Result<Self, Self::Error> {
        Self::try_from(command.as_str())
    }
}
