use std::{io::IoSlice, iter};

use nom::{
    bytes::streaming::{tag, take_till},
    character::streaming::one_of,
    combinator::{map, verify},
    sequence::{pair, terminated},
    IResult,
};

use crate::MaybeUtf8;

/// The 3-digit numeric status code found at the start of every SMTP reply
/// line, per RFC5321 section 4.2.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReplyCode {
    digits: [u8; 3],
}

impl ReplyCode {
    pub const SYSTEM_STATUS: ReplyCode = ReplyCode::raw(*b"211");
    pub const HELP_MESSAGE: ReplyCode = ReplyCode::raw(*b"214");
    pub const SERVICE_READY: ReplyCode = ReplyCode::raw(*b"220");
    pub const CLOSING_CHANNEL: ReplyCode = ReplyCode::raw(*b"221");
    pub const OKAY: ReplyCode = ReplyCode::raw(*b"250");
    pub const USER_NOT_LOCAL_WILL_FORWARD: ReplyCode = ReplyCode::raw(*b"251");
    pub const CANNOT_VRFY_BUT_PLEASE_TRY: ReplyCode = ReplyCode::raw(*b"252");
    pub const START_MAIL_INPUT: ReplyCode = ReplyCode::raw(*b"354");
    pub const SERVICE_NOT_AVAILABLE: ReplyCode = ReplyCode::raw(*b"421");
    pub const MAILBOX_TEMPORARILY_UNAVAILABLE: ReplyCode = ReplyCode::raw(*b"450");
    pub const LOCAL_ERROR: ReplyCode = ReplyCode::raw(*b"451");
    pub const INSUFFICIENT_STORAGE: ReplyCode = ReplyCode::raw(*b"452");
    pub const UNABLE_TO_ACCEPT_PARAMETERS: ReplyCode = ReplyCode::raw(*b"455");
    pub const COMMAND_UNRECOGNIZED: ReplyCode = ReplyCode::raw(*b"500");
    pub const SYNTAX_ERROR: ReplyCode = ReplyCode::raw(*b"501");
    pub const COMMAND_UNIMPLEMENTED: ReplyCode = ReplyCode::raw(*b"502");
    pub const BAD_SEQUENCE: ReplyCode = ReplyCode::raw(*b"503");
    pub const PARAMETER_UNIMPLEMENTED: ReplyCode = ReplyCode::raw(*b"504");
    pub const MAILBOX_UNAVAILABLE: ReplyCode = ReplyCode::raw(*b"550");
    pub const POLICY_REASON: ReplyCode = ReplyCode::raw(*b"550");
    pub const USER_NOT_LOCAL: ReplyCode = ReplyCode::raw(*b"551");
    pub const EXCEEDED_STORAGE: ReplyCode = ReplyCode::raw(*b"552");
    pub const MAILBOX_NAME_INCORRECT: ReplyCode = ReplyCode::raw(*b"553");
    pub const TRANSACTION_FAILED: ReplyCode = ReplyCode::raw(*b"554");
    pub const MAIL_OR_RCPT_PARAMETER_UNIMPLEMENTED: ReplyCode = ReplyCode::raw(*b"555");

    const fn raw(digits: [u8; 3]) -> ReplyCode {
        ReplyCode { digits }
    }

    /// Builds a `ReplyCode` out of a 3-digit SMTP status code, eg. `250`.
    pub fn custom(code: u16) -> ReplyCode {
        assert!(code < 1000, "SMTP reply codes must fit in 3 digits");
        ReplyCode {
            digits: [
                b'0' + (code / 100) as u8,
                b'0' + (code / 10 % 10) as u8,
                b'0' + (code % 10) as u8,
            ],
        }
    }

    pub fn code(&self) -> u16 {
        100 * (self.digits[0] - b'0') as u16
            + 10 * (self.digits[1] - b'0') as u16
            + (self.digits[2] - b'0') as u16
    }

    /// Classifies the reply by its first digit.
    pub fn kind(&self) -> ReplyCodeKind {
        match self.digits[0] {
            b'1' => ReplyCodeKind::PositivePreliminary,
            b'2' => ReplyCodeKind::PositiveCompletion,
            b'3' => ReplyCodeKind::PositiveIntermediate,
            b'4' => ReplyCodeKind::TransientNegative,
            _ => ReplyCodeKind::PermanentNegative,
        }
    }

    /// Classifies the reply by its second digit.
    pub fn category(&self) -> ReplyCodeCategory {
        match self.digits[1] {
            b'0' => ReplyCodeCategory::Syntax,
            b'1' => ReplyCodeCategory::Information,
            b'2' => ReplyCodeCategory::Connections,
            b'5' => ReplyCodeCategory::MailSystem,
            d => ReplyCodeCategory::Unspecified(d - b'0'),
        }
    }

    fn parse(buf: &[u8]) -> IResult<&[u8], ReplyCode> {
        map(
            verify(nom::bytes::streaming::take(3usize), |d: &[u8]| {
                d.iter().all(u8::is_ascii_digit)
            }),
            |d: &[u8]| ReplyCode {
                digits: [d[0], d[1], d[2]],
            },
        )(buf)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyCodeKind {
    PositivePreliminary,
    PositiveCompletion,
    PositiveIntermediate,
    TransientNegative,
    PermanentNegative,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyCodeCategory {
    Syntax,
    Information,
    Connections,
    MailSystem,
    Unspecified(u8),
}

/// RFC3463 enhanced status code class (the first number of `x.y.z`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnhancedReplyCodeClass {
    Success,
    TransientFailure,
    PermanentFailure,
}

/// RFC3463 enhanced status code subject (the `y` of `x.y.z`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnhancedReplyCodeSubject {
    Undefined,
    Addressing,
    Mailbox,
    MailSystem,
    NetworkAndRouting,
    MailDeliveryProtocol,
    MessageContentOrMedia,
    SecurityOrPolicy,
    Other(u8),
}

/// An enhanced mail system status code, as defined by RFC3463, eg. `2.1.5`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnhancedReplyCode<S = String> {
    pub raw: S,
}

impl EnhancedReplyCode<&'static str> {
    pub const SUCCESS_UNDEFINED: Self = EnhancedReplyCode { raw: "2.0.0" };
    pub const SUCCESS_DEST_VALID: Self = EnhancedReplyCode { raw: "2.1.5" };
    pub const PERMANENT_UNDEFINED: Self = EnhancedReplyCode { raw: "5.0.0" };
    pub const PERMANENT_INVALID_COMMAND: Self = EnhancedReplyCode { raw: "5.5.1" };
    pub const TRANSIENT_UNDEFINED: Self = EnhancedReplyCode { raw: "4.0.0" };
    pub const TRANSIENT_SYSTEM_INCORRECTLY_CONFIGURED: Self =
        EnhancedReplyCode { raw: "4.3.5" };
}

impl<'a, S> From<EnhancedReplyCode<&'a str>> for EnhancedReplyCode<S>
where
    S: From<&'a str>,
{
    fn from(e: EnhancedReplyCode<&'a str>) -> Self {
        EnhancedReplyCode { raw: e.raw.into() }
    }
}

impl<S> EnhancedReplyCode<S>
where
    S: AsRef<str>,
{
    pub fn class(&self) -> EnhancedReplyCodeClass {
        match self.raw.as_ref().as_bytes().first() {
            Some(b'2') => EnhancedReplyCodeClass::Success,
            Some(b'4') => EnhancedReplyCodeClass::TransientFailure,
            _ => EnhancedReplyCodeClass::PermanentFailure,
        }
    }

    pub fn subject(&self) -> EnhancedReplyCodeSubject {
        let subject = self.raw.as_ref().split('.').nth(1).unwrap_or("");
        match subject.parse::<u8>() {
            Ok(0) => EnhancedReplyCodeSubject::Undefined,
            Ok(1) => EnhancedReplyCodeSubject::Addressing,
            Ok(2) => EnhancedReplyCodeSubject::Mailbox,
            Ok(3) => EnhancedReplyCodeSubject::MailSystem,
            Ok(4) => EnhancedReplyCodeSubject::NetworkAndRouting,
            Ok(5) => EnhancedReplyCodeSubject::MailDeliveryProtocol,
            Ok(6) => EnhancedReplyCodeSubject::MessageContentOrMedia,
            Ok(7) => EnhancedReplyCodeSubject::SecurityOrPolicy,
            Ok(n) => EnhancedReplyCodeSubject::Other(n),
            Err(_) => EnhancedReplyCodeSubject::Other(255),
        }
    }

    #[inline]
    pub fn as_io_slices(&self) -> impl Iterator<Item = IoSlice> {
        iter::once(IoSlice::new(self.raw.as_ref().as_bytes()))
    }
}

impl EnhancedReplyCode<&str> {
    pub fn to_owned(&self) -> EnhancedReplyCode<String> {
        EnhancedReplyCode {
            raw: (*self.raw).to_owned(),
        }
    }
}

fn enhanced_reply_code<'a>(buf: &'a [u8]) -> IResult<&'a [u8], EnhancedReplyCode<&'a str>> {
    map(
        verify(
            nom::bytes::streaming::take_while1(|c: u8| c.is_ascii_digit() || c == b'.'),
            |raw: &[u8]| {
                // SAFETY: checked to be ascii digits and dots just above
                let raw = unsafe { std::str::from_utf8_unchecked(raw) };
                raw.splitn(3, '.').count() == 3
            },
        ),
        |raw: &[u8]| EnhancedReplyCode {
            raw: unsafe { std::str::from_utf8_unchecked(raw) },
        },
    )(buf)
}

/// One logical SMTP reply, potentially spanning multiple wire lines sharing
/// the same [`ReplyCode`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reply<S = String> {
    pub code: ReplyCode,
    pub ecode: Option<EnhancedReplyCode<S>>,
    pub text: Vec<MaybeUtf8<S>>,
}

impl<S> Reply<S>
where
    S: AsRef<str>,
{
    #[inline]
    pub fn as_io_slices(&self) -> impl Iterator<Item = IoSlice> {
        let code = &self.code.digits;
        let ecode = &self.ecode;
        let last = self.text.len().saturating_sub(1);
        (0..self.text.len().max(1)).flat_map(move |i| {
            let is_last = i == last;
            let ecode_slices: Box<dyn Iterator<Item = IoSlice>> = match ecode {
                Some(e) => Box::new(e.as_io_slices().chain(iter::once(IoSlice::new(b" ")))),
                None => Box::new(iter::empty()),
            };
            let text_slices: Box<dyn Iterator<Item = IoSlice>> = match self.text.get(i) {
                Some(t) => Box::new(t.as_io_slices()),
                None => Box::new(iter::empty()),
            };
            iter::once(IoSlice::new(&code[..]))
                .chain(iter::once(IoSlice::new(if is_last { b" " } else { b"-" })))
                .chain(ecode_slices)
                .chain(text_slices)
                .chain(iter::once(IoSlice::new(b"\r\n")))
        })
    }
}

impl Reply<&str> {
    pub fn into_owned(self) -> Reply<String> {
        Reply {
            code: self.code,
            ecode: self.ecode.map(|e| e.to_owned()),
            text: self.text.into_iter().map(|t| t.to_owned()).collect(),
        }
    }
}

fn reply_line<'a>(buf: &'a [u8]) -> IResult<&'a [u8], (ReplyCode, bool, &'a [u8])> {
    let (rem, code) = ReplyCode::parse(buf)?;
    let (rem, is_last) = map(one_of(&b"- "[..]), |c| c == ' ')(rem)?;
    let (rem, text) = terminated(take_till(|c| c == b'\r'), pair(tag(b"\r"), tag(b"\n")))(rem)?;
    Ok((rem, (code, is_last, text)))
}

impl<'a> Reply<&'a str> {
    pub fn parse(buf: &'a [u8]) -> IResult<&'a [u8], Reply<&'a str>> {
        let (mut rem, (code, mut is_last, mut text)) = reply_line(buf)?;
        let mut lines = vec![text];
        while !is_last {
            let (rem2, (code2, is_last2, text2)) = reply_line(rem)?;
            if code2 != code {
                return nom::combinator::fail(rem);
            }
            rem = rem2;
            is_last = is_last2;
            text = text2;
            lines.push(text);
        }

        // An enhanced status code, if present, is only ever repeated on the
        // first line: RFC3463 section 3.
        let mut ecode = None;
        let mut owned_lines = Vec::with_capacity(lines.len());
        for (i, line) in lines.into_iter().enumerate() {
            if i == 0 {
                if let Ok((after, e)) = pair(enhanced_reply_code, tag(" "))(line) {
                    ecode = Some(e.0);
                    owned_lines.push(to_maybe_utf8(after));
                    continue;
                }
            }
            owned_lines.push(to_maybe_utf8(line));
        }

        Ok((
            rem,
            Reply {
                code,
                ecode,
                text: owned_lines,
            },
        ))
    }
}

fn to_maybe_utf8(b: &[u8]) -> MaybeUtf8<&str> {
    match std::str::from_utf8(b) {
        Ok(s) => MaybeUtf8::from(s),
        Err(_) => MaybeUtf8::Ascii(unsafe { std::str::from_utf8_unchecked(b) }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_code_kind_and_category() {
        assert_eq!(ReplyCode::OKAY.kind(), ReplyCodeKind::PositiveCompletion);
        assert_eq!(ReplyCode::OKAY.category(), ReplyCodeCategory::MailSystem);
        assert_eq!(
            ReplyCode::START_MAIL_INPUT.kind(),
            ReplyCodeKind::PositiveIntermediate
        );
        assert_eq!(
            ReplyCode::MAILBOX_UNAVAILABLE.kind(),
            ReplyCodeKind::PermanentNegative
        );
        assert_eq!(
            ReplyCode::SERVICE_NOT_AVAILABLE.kind(),
            ReplyCodeKind::TransientNegative
        );
    }

    #[test]
    fn reply_code_custom_roundtrip() {
        assert_eq!(ReplyCode::custom(421).code(), 421);
        assert_eq!(ReplyCode::custom(250), ReplyCode::OKAY);
    }

    #[test]
    fn enhanced_reply_code_parsing() {
        assert_eq!(
            EnhancedReplyCode::SUCCESS_DEST_VALID.class(),
            EnhancedReplyCodeClass::Success
        );
        assert_eq!(
            EnhancedReplyCode::SUCCESS_DEST_VALID.subject(),
            EnhancedReplyCodeSubject::Addressing
        );
        assert_eq!(
            EnhancedReplyCode::PERMANENT_INVALID_COMMAND.subject(),
            EnhancedReplyCodeSubject::MailDeliveryProtocol
        );
    }

    #[test]
    fn parse_single_line() {
        let (rem, r) = Reply::parse(b"250 2.1.5 Okay\r\n").unwrap();
        assert_eq!(rem, b"");
        assert_eq!(r.code, ReplyCode::OKAY);
        assert_eq!(r.ecode.unwrap().raw, "2.1.5");
        assert_eq!(r.text, vec![MaybeUtf8::Ascii("Okay")]);
    }

    #[test]
    fn parse_multi_line() {
        let (rem, r) = Reply::parse(b"250-first\r\n250-second\r\n250 third\r\n").unwrap();
        assert_eq!(rem, b"");
        assert_eq!(r.code, ReplyCode::OKAY);
        assert!(r.ecode.is_none());
        assert_eq!(
            r.text,
            vec![
                MaybeUtf8::Ascii("first"),
                MaybeUtf8::Ascii("second"),
                MaybeUtf8::Ascii("third"),
            ]
        );
    }

    #[test]
    fn parse_incomplete() {
        assert!(Reply::parse(b"250-first\r\n250 seco")
            .unwrap_err()
            .is_incomplete());
    }

    #[test]
    fn parse_mismatched_code_is_failure() {
        assert!(Reply::parse(b"250-first\r\n251 second\r\n").is_err());
    }

    #[test]
    fn build_reply() {
        let r = Reply {
            code: ReplyCode::SERVICE_READY,
            ecode: Some(EnhancedReplyCode::SUCCESS_UNDEFINED),
            text: vec![MaybeUtf8::Ascii("hello")],
        };
        let slices = r.as_io_slices().collect::<Vec<_>>();
        let mut out = Vec::new();
        for s in &slices {
            out.extend_from_slice(s);
        }
        assert_eq!(out, b"220 2.0.0 hello\r\n");
    }
}
