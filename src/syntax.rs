//-
// Copyright (c) 2026, Postern contributors
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Postern is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

//! Lexical structure of the command channel: the fixed keyword table and the
//! helpers that carve a raw line into keyword, argument, and parameters.

use std::str::FromStr;

/// One of the recognised command keywords.
///
/// The command set is fixed by the protocol; there is deliberately no way to
/// register additional verbs at runtime. Anything not in the table is
/// answered with a generic 500.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy,
    Expn,
}

static COMMANDS: &[(&str, Verb)] = &[
    ("HELO", Verb::Helo),
    ("EHLO", Verb::Ehlo),
    ("MAIL", Verb::Mail),
    ("RCPT", Verb::Rcpt),
    ("DATA", Verb::Data),
    ("RSET", Verb::Rset),
    ("NOOP", Verb::Noop),
    ("QUIT", Verb::Quit),
    ("VRFY", Verb::Vrfy),
    ("EXPN", Verb::Expn),
];

impl FromStr for Verb {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        COMMANDS
            .iter()
            .find(|&&(keyword, _)| keyword.eq_ignore_ascii_case(s))
            .map(|&(_, verb)| verb)
            .ok_or(())
    }
}

/// Splits a raw command line into the keyword token and the trailing
/// argument, if any.
///
/// The split happens at the first space; the argument is trimmed and an
/// empty argument is reported as absent.
pub fn split_command(line: &str) -> (&str, Option<&str>) {
    match line.split_once(' ') {
        Some((keyword, arg)) => {
            let arg = arg.trim();
            (keyword, if arg.is_empty() { None } else { Some(arg) })
        },
        None => (line.trim(), None),
    }
}

/// Strips a leading keyword such as `FROM:` or `TO:` off an argument,
/// case-insensitively, returning the trimmed remainder.
///
/// Returns the empty string when the keyword is not present, which callers
/// report as a syntax error.
pub fn strip_keyword<'a>(text: &'a str, keyword: &str) -> &'a str {
    if text
        .get(..keyword.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(keyword))
    {
        text[keyword.len()..].trim()
    } else {
        ""
    }
}

/// Parses the ESMTP parameter text that follows the address on `MAIL`.
///
/// Every token must be a `KEY=VALUE` pair; `None` means the parameter list
/// as a whole is malformed.
pub fn parse_mail_params(text: &str) -> Option<Vec<(&str, &str)>> {
    let mut params = Vec::new();
    for token in text.split(' ').filter(|t| !t.is_empty()) {
        let (key, value) = token.split_once('=')?;
        params.push((key, value));
    }

    Some(params)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verb_lookup() {
        assert_eq!(Ok(Verb::Helo), "HELO".parse());
        assert_eq!(Ok(Verb::Helo), "helo".parse());
        assert_eq!(Ok(Verb::Ehlo), "EHLO".parse());
        assert_eq!(Ok(Verb::Mail), "MaIl".parse());
        assert_eq!(Ok(Verb::Rcpt), "RCPT".parse());
        assert_eq!(Ok(Verb::Data), "DATA".parse());
        assert_eq!(Ok(Verb::Rset), "RSET".parse());
        assert_eq!(Ok(Verb::Noop), "noop".parse());
        assert_eq!(Ok(Verb::Quit), "QUIT".parse());
        assert_eq!(Ok(Verb::Vrfy), "VRFY".parse());
        assert_eq!(Ok(Verb::Expn), "EXPN".parse());

        assert_eq!(Err(()), "BOGUS".parse::<Verb>());
        assert_eq!(Err(()), "DATABASE".parse::<Verb>());
        assert_eq!(Err(()), "".parse::<Verb>());
        assert_eq!(Err(()), "HELO example.com".parse::<Verb>());
    }

    #[test]
    fn command_splitting() {
        assert_eq!(("HELO", Some("example.com")), split_command("HELO example.com"));
        assert_eq!(("HELO", None), split_command("HELO"));
        assert_eq!(("HELO", None), split_command("HELO   "));
        assert_eq!(("DATA", None), split_command("DATA"));
        assert_eq!(
            ("MAIL", Some("FROM:<a@b> SIZE=5")),
            split_command("MAIL FROM:<a@b> SIZE=5")
        );
        // A leading space leaves an empty keyword, which no verb matches.
        assert_eq!(("", Some("HELO example.com")), split_command(" HELO example.com"));
        assert_eq!(
            ("EHLO", Some("mail.example.com extra words")),
            split_command("EHLO mail.example.com extra words   ")
        );
    }

    #[test]
    fn keyword_stripping() {
        assert_eq!("<a@b>", strip_keyword("FROM:<a@b>", "FROM:"));
        assert_eq!("<a@b>", strip_keyword("from:<a@b>", "FROM:"));
        assert_eq!("<a@b>", strip_keyword("FROM: <a@b>", "FROM:"));
        assert_eq!("", strip_keyword("<a@b>", "FROM:"));
        assert_eq!("", strip_keyword("", "FROM:"));
        assert_eq!("<c@d>", strip_keyword("TO:<c@d>", "TO:"));
        assert_eq!("", strip_keyword("FROM:", "FROM:"));
    }

    #[test]
    fn mail_param_parsing() {
        assert_eq!(Some(vec![("SIZE", "100")]), parse_mail_params("SIZE=100"));
        assert_eq!(
            Some(vec![("SIZE", "100"), ("BODY", "8BITMIME")]),
            parse_mail_params("SIZE=100 BODY=8BITMIME")
        );
        // Runs of spaces between parameters are tolerated.
        assert_eq!(
            Some(vec![("SIZE", "1"), ("FOO", "BAR")]),
            parse_mail_params("SIZE=1  FOO=BAR")
        );
        assert_eq!(Some(vec![("SIZE", "")]), parse_mail_params("SIZE="));
        assert_eq!(Some(vec![]), parse_mail_params(""));
        assert_eq!(None, parse_mail_params("FOO"));
        assert_eq!(None, parse_mail_params("SIZE=5 JUNK"));
    }
}
