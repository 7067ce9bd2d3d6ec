use chrono::{DateTime, Utc};

/// IMF-fixdate layout used by the `date` and `last-modified` headers
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Current time as an HTTP date, e.g. `Tue, 15 Nov 1994 08:12:31 GMT`
pub fn http_date_now() -> String {
    format_http_date(Utc::now())
}

pub fn format_http_date(at: DateTime<Utc>) -> String {
    at.format(HTTP_DATE_FORMAT).to_string()
}
