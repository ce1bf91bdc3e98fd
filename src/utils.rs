use chrono::{DateTime, NaiveDateTime, Utc};
use url::Url;

/// Raw URI host of a url with a trailing slash, however it is formatted.
///
/// `www.server.com/something` becomes `https://www.server.com/` and
/// `http://localhost:8080/something` becomes `http://localhost:8080/`.
pub fn host_from_url(host: &str) -> Option<String> {
    let host = if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    };
    let url = Url::parse(&host).ok()?;
    let name = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}/", url.scheme(), name, port),
        None => format!("{}://{}/", url.scheme(), name),
    })
}

/// Lenient boolean parsing for environment flags
pub fn strtobool(s: &str) -> bool {
    matches!(
        s.to_ascii_lowercase().as_str(),
        "true" | "t" | "yes" | "y" | "on" | "1"
    )
}

/// Human readable size in binary units, e.g. `1.5KiB`
pub fn format_size(num: u64) -> String {
    const UNITS: [&str; 8] = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"];
    if num == 0 {
        return "-".to_string();
    }
    let mut value = num as f64;
    let mut magnitude = 0;
    while value >= 1024.0 && magnitude < UNITS.len() - 1 {
        value /= 1024.0;
        magnitude += 1;
    }
    format!("{:.1}{}B", value, UNITS[magnitude])
}

/// Parse the timestamps the services return (RFC 3339 or naive ISO 8601 in UTC)
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Convert numeric strings into JSON numbers. Keys starting with `date_` are left alone.
pub fn smart_cast(name: &str, value: serde_json::Value) -> serde_json::Value {
    let serde_json::Value::String(s) = &value else {
        return value;
    };
    if s.is_empty() || name.starts_with("date_") {
        return value;
    }
    if let Ok(i) = s.parse::<i64>() {
        return i.into();
    }
    s.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(serde_json::Value::Number)
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn host_is_normalised() {
        assert_eq!(host_from_url("www.server.com/something").unwrap(), "https://www.server.com/");
        assert_eq!(host_from_url("http://www.server.com").unwrap(), "http://www.server.com/");
        assert_eq!(
            host_from_url("http://localhost:8080/something").unwrap(),
            "http://localhost:8080/"
        );
    }

    #[test]
    fn flags() {
        assert!(strtobool("Yes"));
        assert!(strtobool("1"));
        assert!(!strtobool("off"));
        assert!(!strtobool(""));
    }

    #[test]
    fn sizes() {
        assert_eq!(format_size(0), "-");
        assert_eq!(format_size(100), "100.0B");
        assert_eq!(format_size(1536), "1.5KiB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0MiB");
    }

    #[test]
    fn timestamps() {
        assert!(parse_timestamp("2019-10-01T12:00:00+00:00").is_some());
        assert!(parse_timestamp("2019-10-01T12:00:00.123456").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn casting() {
        assert_eq!(smart_cast("cpu", json!("4")), json!(4));
        assert_eq!(smart_cast("mem", json!("1.5")), json!(1.5));
        assert_eq!(smart_cast("name", json!("align")), json!("align"));
        assert_eq!(smart_cast("date_start", json!("2019")), json!("2019"));
        assert_eq!(smart_cast("n", json!(3)), json!(3));
    }
}
