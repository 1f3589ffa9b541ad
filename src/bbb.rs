use crate::checksum::sha1_hex;
use crate::config::Config;
use crate::models::Server;
use crate::xml::{self, XmlValue};
use indexmap::IndexMap;

/// Client for one upstream BBB server: builds checksum-signed URLs, issues
/// requests, parses the XML response. Stateless beyond the base url and
/// secret.
#[derive(Debug, Clone)]
pub struct BbbApi {
    pub api_url: String,
    secret: String,
}

#[derive(Debug)]
pub enum BbbError {
    /// Transport failure; surfaced to clients as a `noResponse` envelope.
    NoResponse(String),
    /// The upstream body was not parseable XML.
    XmlSyntax(String),
}

impl std::fmt::Display for BbbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BbbError::NoResponse(e) => write!(f, "no response from upstream: {e}"),
            BbbError::XmlSyntax(e) => write!(f, "XMLSyntaxError: {e}"),
        }
    }
}

/// Ensure a url looks like `https://<host>/bigbluebutton/api/`: add the
/// scheme when missing, drop any path, append the api suffix. Idempotent.
pub fn normalize_url(raw: &str) -> String {
    let mut url = raw.to_string();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        url = format!("https://{url}");
    }
    if !url.ends_with("/bigbluebutton/api/") {
        // Cut everything after the host, then append the api path
        let host_end = url[8.min(url.len())..]
            .find('/')
            .map(|i| i + 8)
            .unwrap_or(url.len());
        url = format!("{}/bigbluebutton/api/", &url[..host_end]);
    }
    url
}

/// Url-encode parameters in insertion order. The order is observable: the
/// checksum is computed over this exact string.
pub fn encode_params(params: &IndexMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

impl BbbApi {
    pub fn new(url: &str, secret: &str) -> BbbApi {
        BbbApi {
            api_url: normalize_url(url),
            secret: secret.to_string(),
        }
    }

    pub fn for_server(server: &Server) -> BbbApi {
        BbbApi::new(&server.url, &server.secret)
    }

    /// A client imitating a BBB server for the gateway itself, used to sign
    /// self-referential urls (the rejoin logoutURL override).
    pub fn for_gateway(config: &Config) -> BbbApi {
        BbbApi {
            api_url: format!("https://{}/bigbluebutton/api/", config.hostname),
            secret: config.secret.clone(),
        }
    }

    /// `<base><call>?<query>&checksum=<hex>` with
    /// checksum = sha1_hex(call + query + secret).
    pub fn build_api_url(&self, api_call: &str, params: &IndexMap<String, String>) -> String {
        let param_string = encode_params(params);
        let checksum = sha1_hex(&format!("{api_call}{param_string}{}", self.secret));
        format!("{}{api_call}?{param_string}&checksum={checksum}", self.api_url)
    }

    /// Signed GET. Returns the parsed content of the `<response>` element.
    pub async fn send(
        &self,
        client: &reqwest::Client,
        api_call: &str,
        params: &IndexMap<String, String>,
    ) -> Result<XmlValue, BbbError> {
        let url = self.build_api_url(api_call, params);
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| BbbError::NoResponse(e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| BbbError::NoResponse(e.to_string()))?;
        xml::parse_response(&body).map_err(|e| BbbError::XmlSyntax(e.to_string()))
    }
}

/// BBB reports outcomes in-band; transport success still carries a
/// `<returncode>` of SUCCESS or FAILED.
pub fn is_success(response: &XmlValue) -> bool {
    response.str_of("returncode") == Some("SUCCESS")
}
