//! `MatchSender`/`MatchRcptTo`/`MatchHeader`/`MatchBody`/`DefaultMailbox`:
//! the first matching rule in a stage's own list sets `meta.mailbox`.

use feathermail_pipeline::Meta;
use feathermail_transform::{DataTransform, MetaTransform, TransformError};
use regex::Regex;

fn compile_rules(rules: &[(String, String)]) -> Result<Vec<(Regex, String)>, String> {
    rules
        .iter()
        .map(|(pattern, mailbox)| {
            Regex::new(pattern)
                .map(|regex| (regex, mailbox.clone()))
                .map_err(|error| format!("invalid pattern `{pattern}`: {error}"))
        })
        .collect()
}

fn first_match(rules: &[(Regex, String)], subject: &str) -> Option<String> {
    rules.iter().find(|(regex, _)| regex.is_match(subject)).map(|(_, mailbox)| mailbox.clone())
}

fn headers_and_body(raw: &[u8]) -> (String, &[u8]) {
    let text = String::from_utf8_lossy(raw);
    match text.find("\r\n\r\n") {
        Some(pos) => (text[..pos].to_string(), &raw[pos + 4..]),
        None => (text.to_string(), &[]),
    }
}

fn header_value(headers: &str, name: &str) -> Option<String> {
    let mut lines = headers.lines().peekable();
    while let Some(line) = lines.next() {
        let Some((key, value)) = line.split_once(':') else { continue };
        if !key.trim().eq_ignore_ascii_case(name) {
            continue;
        }
        let mut full = value.trim().to_string();
        while let Some(next) = lines.peek() {
            if next.starts_with(' ') || next.starts_with('\t') {
                full.push(' ');
                full.push_str(next.trim());
                lines.next();
            } else {
                break;
            }
        }
        return Some(full);
    }
    None
}

pub struct MatchSender {
    rules: Vec<(Regex, String)>,
}

impl MatchSender {
    pub fn new(rules: &[(String, String)]) -> Result<Self, String> {
        Ok(Self { rules: compile_rules(rules)? })
    }
}

impl MetaTransform for MatchSender {
    fn transform_meta(&self, mut meta: Meta) -> Result<Meta, TransformError> {
        if let Some(from) = meta.from() {
            if let Some(mailbox) = first_match(&self.rules, from) {
                meta.set_mailbox(mailbox);
            }
        }
        Ok(meta)
    }
}

pub struct MatchRcptTo {
    rules: Vec<(Regex, String)>,
}

impl MatchRcptTo {
    pub fn new(rules: &[(String, String)]) -> Result<Self, String> {
        Ok(Self { rules: compile_rules(rules)? })
    }
}

impl MetaTransform for MatchRcptTo {
    fn transform_meta(&self, mut meta: Meta) -> Result<Meta, TransformError> {
        for rcpt in meta.to() {
            if let Some(mailbox) = first_match(&self.rules, &rcpt) {
                meta.set_mailbox(mailbox);
                break;
            }
        }
        Ok(meta)
    }
}

pub struct MatchHeader {
    header: String,
    rules: Vec<(Regex, String)>,
}

impl MatchHeader {
    pub fn new(header: String, rules: &[(String, String)]) -> Result<Self, String> {
        Ok(Self { header, rules: compile_rules(rules)? })
    }
}

impl DataTransform for MatchHeader {
    fn transform_data(&self, raw: Vec<u8>, mut meta: Meta) -> Result<(Vec<u8>, Meta), TransformError> {
        let (headers, _) = headers_and_body(&raw);
        if let Some(value) = header_value(&headers, &self.header) {
            if let Some(mailbox) = first_match(&self.rules, &value) {
                meta.set_mailbox(mailbox);
            }
        }
        Ok((raw, meta))
    }
}

pub struct MatchBody {
    rules: Vec<(Regex, String)>,
}

impl MatchBody {
    pub fn new(rules: &[(String, String)]) -> Result<Self, String> {
        Ok(Self { rules: compile_rules(rules)? })
    }
}

impl DataTransform for MatchBody {
    fn transform_data(&self, raw: Vec<u8>, mut meta: Meta) -> Result<(Vec<u8>, Meta), TransformError> {
        let (_, body) = headers_and_body(&raw);
        let body_text = String::from_utf8_lossy(body);
        if let Some(mailbox) = first_match(&self.rules, &body_text) {
            meta.set_mailbox(mailbox);
        }
        Ok((raw, meta))
    }
}

/// Sets `meta.mailbox` to a fixed value when nothing upstream claimed one.
pub struct DefaultMailbox {
    mailbox: String,
}

impl DefaultMailbox {
    #[must_use]
    pub fn new(mailbox: String) -> Self {
        Self { mailbox }
    }
}

impl MetaTransform for DefaultMailbox {
    fn transform_meta(&self, mut meta: Meta) -> Result<Meta, TransformError> {
        if meta.mailbox().is_none() {
            meta.set_mailbox(self.mailbox.clone());
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_sender_sets_mailbox_on_first_hit() {
        let stage = MatchSender::new(&[
            (r"@vip\.example\.com$".to_string(), "vip".to_string()),
            (r".*".to_string(), "catchall".to_string()),
        ])
        .unwrap();
        let mut meta = Meta::new("127.0.0.1".parse().unwrap());
        meta.set_from("boss@vip.example.com");
        let meta = stage.transform_meta(meta).unwrap();
        assert_eq!(meta.mailbox(), Some("vip"));
    }

    #[test]
    fn default_mailbox_only_applies_when_absent() {
        let stage = DefaultMailbox::new("inbox".to_string());
        let mut meta = Meta::new("127.0.0.1".parse().unwrap());
        meta.set_mailbox("already-set");
        let meta = stage.transform_meta(meta).unwrap();
        assert_eq!(meta.mailbox(), Some("already-set"));
    }

    #[test]
    fn match_header_reads_folded_header() {
        let stage = MatchHeader::new("X-Team".to_string(), &[(r"eng".to_string(), "engineering".to_string())]).unwrap();
        let raw = b"Subject: hi\r\nX-Team: platform\r\n eng\r\n\r\nbody\r\n".to_vec();
        let meta = Meta::new("127.0.0.1".parse().unwrap());
        let (_, meta) = stage.transform_data(raw, meta).unwrap();
        assert_eq!(meta.mailbox(), Some("engineering"));
    }
}
