use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

lazy_static! {
    static ref EMAIL_REGEX: Option<Regex> =
        Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").ok();
    static ref PHONE_REGEX: Option<Regex> =
        Regex::new(r"(?:\+1[-.\s]?)?(?:\(\d{3}\)|\b\d{3})[-.\s]?\d{3}[-.\s]?\d{4}\b").ok();
    static ref SSN_REGEX: Option<Regex> = Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").ok();
    static ref CREDIT_CARD_REGEX: Option<Regex> =
        Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").ok();
    static ref IP_REGEX: Option<Regex> = Regex::new(r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b").ok();
    static ref MRN_REGEX: Option<Regex> = Regex::new(r"\bMRN[-:]?\s?\d{4,}\b").ok();
}

/// PII redaction configuration
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    pub redact_emails: bool,
    pub redact_phones: bool,
    pub redact_ssn: bool,
    pub redact_credit_cards: bool,
    pub redact_ip_addresses: bool,
    /// Medical record numbers such as `MRN123456`
    pub redact_mrn: bool,
    pub hash_for_correlation: bool,
    pub custom_patterns: Vec<(Regex, String)>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            redact_emails: true,
            redact_phones: true,
            redact_ssn: true,
            redact_credit_cards: true,
            redact_ip_addresses: true,
            redact_mrn: true,
            hash_for_correlation: true,
            custom_patterns: Vec::new(),
        }
    }
}

/// PII redactor for log messages
pub struct PiiRedactor {
    config: RedactionConfig,
}

impl PiiRedactor {
    pub fn new(config: RedactionConfig) -> Self {
        Self { config }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();

        if self.config.redact_emails {
            result = self.replace(&EMAIL_REGEX, &result, "EMAIL", mask_email);
        }
        if self.config.redact_ssn {
            result = self.replace(&SSN_REGEX, &result, "SSN", |_| "***-**-****".to_string());
        }
        if self.config.redact_credit_cards {
            result = self.replace(&CREDIT_CARD_REGEX, &result, "CC", |_| {
                "****-****-****-****".to_string()
            });
        }
        if self.config.redact_phones {
            result = self.replace(&PHONE_REGEX, &result, "PHONE", |_| "(***) ***-****".to_string());
        }
        if self.config.redact_ip_addresses {
            result = self.replace(&IP_REGEX, &result, "IP", mask_ip);
        }
        if self.config.redact_mrn {
            result = self.replace(&MRN_REGEX, &result, "MRN", |_| "MRN[REDACTED]".to_string());
        }

        for (pattern, replacement) in &self.config.custom_patterns {
            result = pattern.replace_all(&result, replacement.as_str()).to_string();
        }

        result
    }

    fn replace(
        &self,
        regex: &Option<Regex>,
        text: &str,
        label: &str,
        mask: impl Fn(&str) -> String,
    ) -> String {
        let Some(regex) = regex else {
            return text.to_string();
        };
        regex
            .replace_all(text, |caps: &regex::Captures| {
                let matched = caps.get(0).map_or("", |m| m.as_str());
                if self.config.hash_for_correlation {
                    format!("{}[{}]", label, hash_value(matched))
                } else {
                    mask(matched)
                }
            })
            .to_string()
    }
}

impl Default for PiiRedactor {
    fn default() -> Self {
        Self::new(RedactionConfig::default())
    }
}

/// Short, stable correlation hash of a sensitive value
pub fn hash_value(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    general_purpose::STANDARD.encode(&digest[..8])
}

/// Keep the first letter of every name part: `Jane Roe` becomes `J*** R***`
pub fn mask_name(name: &str) -> String {
    name.split_whitespace()
        .map(|part| match part.chars().next() {
            Some(first) => format!("{}***", first),
            None => String::new(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((user, domain)) => {
            let u = user.chars().next().unwrap_or('*');
            let d = domain.chars().next().unwrap_or('*');
            format!("{}***@{}***", u, d)
        }
        None => "***@***".to_string(),
    }
}

fn mask_ip(ip: &str) -> String {
    let parts: Vec<&str> = ip.split('.').collect();
    match (parts.first(), parts.last()) {
        (Some(first), Some(last)) if parts.len() == 4 => format!("{}.***.***.{}", first, last),
        _ => "***.***.***.***".to_string(),
    }
}
