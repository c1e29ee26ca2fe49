use std::borrow::Cow;

/// Redacts the credentials of a connection url so it can be logged.
///
/// Tenant urls come from the catalog and routinely carry passwords.
pub fn sanitize_database_url(raw: &str) -> Cow<'_, str> {
    let Some(scheme_end) = raw.find("://") else {
        // sqlite:path and sqlite::memory: carry no credentials
        return if raw.starts_with("sqlite:") {
            Cow::Borrowed(raw)
        } else {
            Cow::Borrowed("<redacted>")
        };
    };
    let rest = &raw[scheme_end + 3..];
    let authority = &rest[..rest.find('/').unwrap_or(rest.len())];

    match authority.rfind('@') {
        Some(at_pos) => {
            let scheme = &raw[..scheme_end + 3];
            let host_and_rest = &rest[at_pos + 1..];
            Cow::Owned(format!("{scheme}****:****@{host_and_rest}"))
        }
        None => Cow::Borrowed(raw),
    }
}
