use url::Url;

/// Decide whether an image request with the given `Referer` may be served.
///
/// A request without a referer is allowed. Otherwise the referer host must be
/// the request's own host or match one of `allowed`, where an entry is a bare
/// host, a `*.domain` wildcard, or a full URL.
pub fn referer_allowed(referer: Option<&str>, host: Option<&str>, allowed: &[String]) -> bool {
    let referer = match referer.map(str::trim) {
        None | Some("") => return true,
        Some(r) => r,
    };
    let ref_host = match Url::parse(referer)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
    {
        Some(h) => h,
        None => return false,
    };
    if let Some(host) = host {
        if strip_port(host.trim()).eq_ignore_ascii_case(&ref_host) {
            return true;
        }
    }
    allowed.iter().any(|entry| entry_matches(entry, &ref_host))
}

fn entry_matches(entry: &str, ref_host: &str) -> bool {
    let entry = entry.trim().to_ascii_lowercase();
    if entry.is_empty() {
        return false;
    }
    if entry.contains("://") {
        return Url::parse(&entry)
            .ok()
            .and_then(|u| u.host_str().map(|h| h == ref_host))
            .unwrap_or(false);
    }
    if let Some(domain) = entry.strip_prefix("*.") {
        return ref_host == domain || ref_host.ends_with(&format!(".{domain}"));
    }
    strip_port(&entry) == ref_host
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
}
