use hmac::{Hmac, Mac};
use indexmap::IndexMap;
use sha1::Sha1;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Remove every `&checksum=<value>` pair from a raw query string.
///
/// This mirrors the pattern `&checksum=[^&]+`: the leading `&` is part of
/// the match, so a query that puts `checksum=` first keeps the pair (and
/// fails validation). Kept byte-exact because the checksum is computed over
/// whatever survives.
pub fn strip_checksum(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut rest = query;
    while let Some(pos) = rest.find("&checksum=") {
        let value_start = pos + "&checksum=".len();
        let value_end = rest[value_start..]
            .find('&')
            .map(|i| value_start + i)
            .unwrap_or(rest.len());
        if value_end == value_start {
            // `[^&]+` needs at least one character; an empty value is kept
            out.push_str(&rest[..value_start]);
        } else {
            out.push_str(&rest[..pos]);
        }
        rest = &rest[value_end..];
    }
    out.push_str(rest);
    out
}

/// Validate an incoming request checksum: accepts exactly
/// `sha1_hex(endpoint + rest + secret)` and `sha256_hex(endpoint + rest + secret)`
/// where `rest` is the raw query string with the checksum pair stripped.
pub fn verify_api_checksum(endpoint: &str, raw_query: &str, checksum: &str, secret: &str) -> bool {
    let rest = strip_checksum(raw_query);
    let input = format!("{endpoint}{rest}{secret}");
    sha1_hex(&input) == checksum || sha256_hex(&input) == checksum
}

/// Decode one query-string component (percent-encoding plus `+` for space).
pub fn decode_component(raw: &str) -> String {
    let plus_decoded = raw.replace('+', " ");
    urlencoding::decode(&plus_decoded)
        .map(|c| c.into_owned())
        .unwrap_or(plus_decoded)
}

/// Parse a raw query string into decoded pairs, preserving order.
/// Duplicate keys keep the last value, like Django's `request.GET.get`.
pub fn parse_query(raw: &str) -> IndexMap<String, String> {
    let mut params = IndexMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(decode_component(key), decode_component(value));
    }
    params
}

fn canonical(params: &IndexMap<String, String>) -> String {
    let mut pairs: Vec<(&String, &String)> = params.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn hmac_hex(secret: &str, input: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(input.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Request checksum for the player service and the join cookie: hex
/// HMAC-SHA256 over the sorted `key=value` pairs plus a per-endpoint salt.
/// No time component.
pub fn rcp_checksum(params: &IndexMap<String, String>, secret: &str, salt: &str) -> String {
    hmac_hex(secret, &format!("{}{salt}", canonical(params)))
}

/// Time-bound variant used by the monitoring endpoint.
pub fn rcp_checksum_at(
    params: &IndexMap<String, String>,
    secret: &str,
    salt: &str,
    timestamp: i64,
) -> String {
    hmac_hex(secret, &format!("{}{salt}{timestamp}", canonical(params)))
}

/// Validate a time-bound checksum, accepting any timestamp within
/// ± `time_delta` seconds of now.
pub fn validate_rcp_checksum(
    params: &IndexMap<String, String>,
    checksum: &str,
    secret: &str,
    salt: &str,
    time_delta: i64,
) -> bool {
    let now = chrono::Utc::now().timestamp();
    (-time_delta..=time_delta).any(|offset| rcp_checksum_at(params, secret, salt, now + offset) == checksum)
}
