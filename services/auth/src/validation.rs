//! Input validation utilities

use regex::Regex;
use std::sync::OnceLock;
use url::Url;

/// Free mailbox providers: addresses there say nothing about an employer
const PERSONAL_EMAIL_DOMAINS: &[&str] = &[
    "aol.com",
    "fastmail.com",
    "gmail.com",
    "gmx.com",
    "gmx.de",
    "gmx.net",
    "googlemail.com",
    "hey.com",
    "hotmail.co.uk",
    "hotmail.com",
    "hotmail.fr",
    "icloud.com",
    "live.com",
    "mac.com",
    "mail.com",
    "mail.ru",
    "me.com",
    "msn.com",
    "naver.com",
    "outlook.com",
    "outlook.fr",
    "pm.me",
    "proton.me",
    "protonmail.com",
    "qq.com",
    "rambler.ru",
    "tutanota.com",
    "web.de",
    "yahoo.co.uk",
    "yahoo.com",
    "yahoo.fr",
    "yandex.com",
    "yandex.ru",
    "ymail.com",
    "zoho.com",
    "163.com",
    "126.com",
];

/// Throwaway mailbox providers
const DISPOSABLE_EMAIL_DOMAINS: &[&str] = &[
    "10minutemail.com",
    "discard.email",
    "dispostable.com",
    "fakeinbox.com",
    "getnada.com",
    "guerrillamail.com",
    "guerrillamail.net",
    "mailinator.com",
    "maildrop.cc",
    "mintemail.com",
    "mohmal.com",
    "sharklasers.com",
    "temp-mail.org",
    "tempmail.com",
    "throwawaymail.com",
    "trashmail.com",
    "yopmail.com",
];

/// Relay addresses handed out by Sign in with Apple
const APPLE_PRIVATE_RELAY_DOMAIN: &str = "privaterelay.appleid.com";

/// Validate email
pub fn validate_email(email: &str) -> Result<(), String> {
    if email.is_empty() {
        return Err("Email is required".to_string());
    }

    if email.len() > 254 {
        return Err("Email must be at most 254 characters long".to_string());
    }

    static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = EMAIL_REGEX.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
            .expect("Failed to compile email regex")
    });

    if !regex.is_match(email) {
        return Err("Invalid email format".to_string());
    }

    if email_domain(email).is_some_and(is_disposable_domain) {
        return Err("Disposable email addresses are not allowed".to_string());
    }

    Ok(())
}

/// Part of the address after the last `@`
pub fn email_domain(email: &str) -> Option<&str> {
    email
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
}

/// Part of the address before the last `@`, or the whole input
pub fn email_local_part(email: &str) -> &str {
    email
        .rsplit_once('@')
        .map_or(email, |(local_part, _)| local_part)
}

pub fn is_disposable_domain(domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    DISPOSABLE_EMAIL_DOMAINS.contains(&domain.as_str())
}

pub fn is_personal_domain(domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    PERSONAL_EMAIL_DOMAINS.contains(&domain.as_str())
}

/// Whether a domain identifies a single employer
///
/// Only such domains may own an organization and enable domain sign-in.
pub fn is_safe_domain(domain: &str) -> bool {
    !domain.is_empty()
        && !is_personal_domain(domain)
        && !is_disposable_domain(domain)
        && !domain.eq_ignore_ascii_case(APPLE_PRIVATE_RELAY_DOMAIN)
}

/// Whether two URLs share scheme, host and port
///
/// Unparseable input never matches.
pub fn same_origin(left: &str, right: &str) -> bool {
    match (Url::parse(left), Url::parse(right)) {
        (Ok(left), Ok(right)) => {
            let (left, right) = (left.origin(), right.origin());
            left.is_tuple() && left == right
        }
        _ => false,
    }
}
