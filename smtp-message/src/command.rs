use nom::{
    branch::alt,
    bytes::streaming::{tag, tag_no_case, take_till, take_while1},
    character::streaming::{char, space0, space1},
    combinator::{map, opt, value},
    multi::separated_list0,
    sequence::{pair, preceded, terminated},
    IResult,
};

use crate::{email_with_path, Email, Hostname, MaybeUtf8, Path};

/// A single ESMTP parameter, as found after `MAIL FROM:<...>` or
/// `RCPT TO:<...>`, eg. `SIZE=1234` or the valueless `BODY`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParameterName<S>(pub S);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Parameters<S>(pub Vec<(ParameterName<S>, Option<S>)>);

impl<S> Parameters<S> {
    pub fn iter(&self) -> impl Iterator<Item = &(ParameterName<S>, Option<S>)> {
        self.0.iter()
    }
}

fn is_param_char(c: u8) -> bool {
    c > 32 && c != b'=' && c != 127
}

fn esmtp_param<'a>(buf: &'a [u8]) -> IResult<&'a [u8], (ParameterName<&'a str>, Option<&'a str>)> {
    let (rem, name) = take_while1(is_param_char)(buf)?;
    let (rem, value) = opt(preceded(char('='), take_while1(is_param_char)))(rem)?;
    // is_param_char only accepts printable ascii
    let name = unsafe { std::str::from_utf8_unchecked(name) };
    let value = value.map(|v| unsafe { std::str::from_utf8_unchecked(v) });
    Ok((rem, (ParameterName(name), value)))
}

fn esmtp_params<'a>(buf: &'a [u8]) -> IResult<&'a [u8], Parameters<&'a str>> {
    map(separated_list0(space1, esmtp_param), Parameters)(buf)
}

/// Parsed form of a single SMTP command line, including its trailing CRLF.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command<S> {
    Data,
    Ehlo { hostname: Hostname<S> },
    Expn { name: MaybeUtf8<S> },
    Helo { hostname: Hostname<S> },
    Help { subject: MaybeUtf8<S> },
    Mail {
        path: Option<Path<S>>,
        email: Option<Email<S>>,
        params: Parameters<S>,
    },
    Noop { string: MaybeUtf8<S> },
    Quit,
    Rcpt {
        path: Option<Path<S>>,
        email: Email<S>,
        params: Parameters<S>,
    },
    Rset,
    Starttls,
    Vrfy { name: MaybeUtf8<S> },
}

fn crlf<'a>(buf: &'a [u8]) -> IResult<&'a [u8], &'a [u8]> {
    tag(b"\r\n")(buf)
}

fn rest_of_line<'a>(buf: &'a [u8]) -> IResult<&'a [u8], &'a [u8]> {
    terminated(take_till(|c| c == b'\r'), crlf)(buf)
}

fn to_maybe_utf8(b: &[u8]) -> MaybeUtf8<&str> {
    match std::str::from_utf8(b) {
        Ok(s) => MaybeUtf8::from(s),
        // Not valid utf-8, but arguments to these commands are free-form text
        // that we still want to hand back to the caller instead of rejecting
        Err(_) => MaybeUtf8::Ascii(unsafe { std::str::from_utf8_unchecked(b) }),
    }
}

fn path_and_mailbox<'a>(
    buf: &'a [u8],
) -> IResult<&'a [u8], (Option<Path<&'a str>>, Option<Email<&'a str>>)> {
    alt((
        value((None, None), tag(b"<>")),
        map(
            email_with_path(b" \r", b" \r@", b" \r>", b" \r@>"),
            |(path, email)| (path, Some(email)),
        ),
    ))(buf)
}

impl<'a> Command<&'a str> {
    pub fn parse(buf: &'a [u8]) -> IResult<&'a [u8], Command<&'a str>> {
        alt((
            value(
                Command::Data,
                preceded(pair(tag_no_case("DATA"), space0), crlf),
            ),
            map(
                preceded(
                    pair(tag_no_case("EHLO"), space1),
                    terminated(Hostname::parse_until(b"\r"), crlf),
                ),
                |hostname| Command::Ehlo { hostname },
            ),
            map(
                preceded(pair(tag_no_case("EXPN"), space1), rest_of_line),
                |name| Command::Expn {
                    name: to_maybe_utf8(name),
                },
            ),
            map(
                preceded(
                    pair(tag_no_case("HELO"), space1),
                    terminated(Hostname::parse_until(b"\r"), crlf),
                ),
                |hostname| Command::Helo { hostname },
            ),
            map(
                preceded(pair(tag_no_case("HELP"), space0), rest_of_line),
                |subject| Command::Help {
                    subject: to_maybe_utf8(subject),
                },
            ),
            map(
                preceded(
                    tag_no_case("MAIL FROM:"),
                    pair(
                        path_and_mailbox,
                        terminated(preceded(space0, esmtp_params), crlf),
                    ),
                ),
                |((path, email), params)| Command::Mail {
                    path,
                    email,
                    params,
                },
            ),
            map(
                preceded(pair(tag_no_case("NOOP"), space0), rest_of_line),
                |string| Command::Noop {
                    string: to_maybe_utf8(string),
                },
            ),
            value(
                Command::Quit,
                preceded(pair(tag_no_case("QUIT"), space0), crlf),
            ),
            map(
                preceded(
                    tag_no_case("RCPT TO:"),
                    pair(
                        email_with_path(b" \r", b" \r@", b" \r>", b" \r@>"),
                        terminated(preceded(space0, esmtp_params), crlf),
                    ),
                ),
                |((path, email), params)| Command::Rcpt {
                    path,
                    email,
                    params,
                },
            ),
            value(
                Command::Rset,
                preceded(pair(tag_no_case("RSET"), space0), crlf),
            ),
            value(
                Command::Starttls,
                preceded(pair(tag_no_case("STARTTLS"), space0), crlf),
            ),
            map(
                preceded(pair(tag_no_case("VRFY"), space1), rest_of_line),
                |name| Command::Vrfy {
                    name: to_maybe_utf8(name),
                },
            ),
        ))(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_quit_rset_noop() {
        assert_eq!(
            Command::parse(b"DATA\r\n").unwrap(),
            (&b""[..], Command::Data)
        );
        assert_eq!(
            Command::parse(b"QUIT\r\n").unwrap(),
            (&b""[..], Command::Quit)
        );
        assert_eq!(
            Command::parse(b"RSET\r\n").unwrap(),
            (&b""[..], Command::Rset)
        );
        assert_eq!(
            Command::parse(b"NOOP\r\n").unwrap(),
            (&b""[..], Command::Noop {
                string: MaybeUtf8::Ascii("")
            })
        );
    }

    #[test]
    fn starttls() {
        assert_eq!(
            Command::parse(b"STARTTLS\r\n").unwrap(),
            (&b""[..], Command::Starttls)
        );
    }

    #[test]
    fn ehlo_helo() {
        let (rem, cmd) = Command::parse(b"EHLO foo.bar.baz\r\n").unwrap();
        assert_eq!(rem, b"");
        match cmd {
            Command::Ehlo { hostname } => assert_eq!(*hostname.raw(), "foo.bar.baz"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn mail_from_with_params() {
        let (rem, cmd) = Command::parse(b"MAIL FROM:<foo@bar.baz> SIZE=1024\r\n").unwrap();
        assert_eq!(rem, b"");
        match cmd {
            Command::Mail { email, params, .. } => {
                assert!(email.is_some());
                assert_eq!(params.0.len(), 1);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn mail_from_null_sender() {
        let (rem, cmd) = Command::parse(b"MAIL FROM:<>\r\n").unwrap();
        assert_eq!(rem, b"");
        match cmd {
            Command::Mail { email, path, .. } => {
                assert!(email.is_none());
                assert!(path.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rcpt_to() {
        let (rem, cmd) = Command::parse(b"RCPT TO:<baz@quux.foo>\r\n").unwrap();
        assert_eq!(rem, b"");
        match cmd {
            Command::Rcpt { email, .. } => assert_eq!(*email.localpart.raw(), "baz"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rcpt_to_unbracketed() {
        let (rem, cmd) = Command::parse(b"RCPT TO:foo@bar.baz\r\n").unwrap();
        assert_eq!(rem, b"");
        match cmd {
            Command::Rcpt { email, .. } => assert_eq!(*email.localpart.raw(), "foo"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn incomplete_is_incomplete() {
        assert!(Command::parse(b"EHLO foo").unwrap_err().is_incomplete());
    }

    #[test]
    fn garbage_is_error() {
        assert!(!Command::parse(b"GARBAGE\r\n").unwrap_err().is_incomplete());
    }
}
