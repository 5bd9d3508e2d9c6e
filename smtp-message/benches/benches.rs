#![feature(test)]

extern crate test;

use smtp_message::Command;
use test::Bencher;

#[bench]
fn parse_command(b: &mut Bencher) {
    let commands: &[&[u8]] = &[
        b"DATA\r\n",
        b"EHLO example.org\r\n",
        b"EXPN test\r\n",
        b"HELO example.org\r\n",
        b"HELP stuff\r\n",
        b"MAIL FROM:<@example.com,@example.org:test@example.net> FOO=BAR BAZ\r\n",
        b"NOOP things\r\n",
        b"QUIT\r\n",
        b"RCPT TO:<@example.org,@example.com:foo@example.net> THINGS=DONE MAYBE\r\n",
        b"RSET\r\n",
        b"VRFY root\r\n",
    ];
    b.iter(|| {
        for c in commands {
            test::black_box(Command::parse(c).unwrap());
        }
    });
    b.bytes = commands.iter().map(|c| c.len() as u64).sum();
}
