use crate::bbb::BbbError;
use crate::xml::{self, XmlValue};
use indexmap::IndexMap;
use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Redirect, Responder, Response};
use std::io::Cursor;

/// What every gateway handler produces: an XML envelope (always HTTP 200,
/// `text/xml`, success or failure signalled in-band) or a 302 redirect.
pub enum ApiResponse {
    Xml(XmlValue),
    Redirect(Redirect),
}

impl<'r> Responder<'r, 'static> for ApiResponse {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        match self {
            ApiResponse::Xml(value) => {
                let body = xml::emit(&value);
                Response::build()
                    .status(Status::Ok)
                    .header(ContentType::XML)
                    .sized_body(body.len(), Cursor::new(body))
                    .ok()
            }
            ApiResponse::Redirect(redirect) => redirect.respond_to(req),
        }
    }
}

/// Build a `{response: {returncode, message?, messageKey?, ...data}}` tree.
/// Failure envelopes always carry a key and a message.
pub fn respond(
    success: bool,
    message_key: &str,
    message: &str,
    data: Option<IndexMap<String, XmlValue>>,
) -> XmlValue {
    let mut response = IndexMap::new();
    response.insert(
        "returncode".to_string(),
        XmlValue::text(if success { "SUCCESS" } else { "FAILED" }),
    );
    if !success {
        eprintln!("FAILED: {message_key} | {message}");
    }
    if !message.is_empty() {
        response.insert("message".to_string(), XmlValue::text(message));
    }
    if !message_key.is_empty() {
        response.insert("messageKey".to_string(), XmlValue::text(message_key));
    }
    if let Some(data) = data {
        response.extend(data);
    }
    XmlValue::node([("response", XmlValue::Node(response))])
}

pub fn success<I>(entries: I) -> ApiResponse
where
    I: IntoIterator<Item = (&'static str, XmlValue)>,
{
    ApiResponse::Xml(respond(true, "", "", Some(collect_data(entries))))
}

/// A SUCCESS envelope that still carries an informational message key
/// (`noMeetings`, `noRecordings`).
pub fn success_with_key<I>(message_key: &str, message: &str, entries: I) -> ApiResponse
where
    I: IntoIterator<Item = (&'static str, XmlValue)>,
{
    ApiResponse::Xml(respond(true, message_key, message, Some(collect_data(entries))))
}

fn collect_data<I>(entries: I) -> IndexMap<String, XmlValue>
where
    I: IntoIterator<Item = (&'static str, XmlValue)>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

pub fn failed(message_key: &str, message: &str) -> ApiResponse {
    ApiResponse::Xml(respond(false, message_key, message, None))
}

/// Pass an upstream `<response>` through unchanged.
pub fn wrap_upstream(upstream: XmlValue) -> ApiResponse {
    ApiResponse::Xml(XmlValue::node([("response", upstream)]))
}

pub fn checksum_error() -> ApiResponse {
    failed("checksumError", "You did not pass the checksum security check")
}

pub fn missing_meeting_id() -> ApiResponse {
    failed(
        "missingParamMeetingID",
        "You must specify a meeting ID for the meeting.",
    )
}

pub fn meeting_not_found() -> ApiResponse {
    failed(
        "notFound",
        "We could not find a meeting with that meeting ID - perhaps the meeting is not yet running?",
    )
}

pub fn internal_error(message: &str) -> ApiResponse {
    failed("internalError", message)
}

pub fn no_response() -> ApiResponse {
    failed(
        "noResponse",
        "An internal server didn't respond. Try again in some seconds or contact your admin.",
    )
}

/// Translate a client error into the envelope clients see.
pub fn from_bbb_error(error: BbbError) -> ApiResponse {
    match error {
        BbbError::NoResponse(_) => no_response(),
        BbbError::XmlSyntax(e) => internal_error(&format!("An internal server sent a broken response: {e}")),
    }
}
