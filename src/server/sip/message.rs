//! Header access and response construction on top of `rsip`

use rsip::headers::UntypedHeader;
use rsip::{Header, Headers, Request, Response, StatusCode, Version};

pub(crate) fn call_id(headers: &Headers) -> Option<&str> {
    headers.iter().find_map(|h| match h {
        Header::CallId(v) => Some(v.value()),
        _ => None,
    })
}

/// `(sequence, method)` from the CSeq header
pub(crate) fn cseq(headers: &Headers) -> Option<(u32, String)> {
    headers.iter().find_map(|h| match h {
        Header::CSeq(v) => {
            let (seq, method) = v.value().trim().split_once(char::is_whitespace)?;
            Some((seq.trim().parse().ok()?, method.trim().to_ascii_uppercase()))
        }
        _ => None,
    })
}

pub(crate) fn www_authenticate(headers: &Headers) -> Option<&str> {
    headers.iter().find_map(|h| match h {
        Header::WwwAuthenticate(v) => Some(v.value()),
        Header::Other(name, value) if name.eq_ignore_ascii_case("WWW-Authenticate") => {
            Some(value.as_str())
        }
        _ => None,
    })
}

pub(crate) fn has_authorization(headers: &Headers) -> bool {
    headers.iter().any(|h| matches!(h, Header::Authorization(_)))
}

/// `"Display" <uri>` or plain `<uri>` when there is no display name
pub(crate) fn name_addr(display_name: &str, uri: &str) -> String {
    if display_name.is_empty() {
        format!("<{}>", uri)
    } else {
        format!("\"{}\" <{}>", display_name, uri)
    }
}

/// Build a response to `request`, copying the transaction headers.
///
/// `to_tag` is appended to the To header unless it already carries one.
pub(crate) fn response_for(request: &Request, status_code: StatusCode, to_tag: Option<&str>) -> Response {
    let mut headers = Headers::default();

    for header in request.headers.iter() {
        match header {
            Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                headers.push(header.clone())
            }
            Header::To(to) => {
                let value = match to_tag {
                    Some(tag) if !to.value().contains(";tag=") => {
                        format!("{};tag={}", to.value(), tag)
                    }
                    _ => to.value().to_string(),
                };
                headers.push(Header::To(rsip::headers::To::new(value)));
            }
            _ => {}
        }
    }

    Response {
        status_code,
        version: Version::V2,
        headers,
        body: Vec::new(),
    }
}

/// Finish a message: optional typed body plus Content-Length
pub(crate) fn set_body(headers: &mut Headers, body: &mut Vec<u8>, content: Option<(&str, Vec<u8>)>) {
    if let Some((content_type, bytes)) = content {
        headers.push(Header::ContentType(rsip::headers::ContentType::new(content_type)));
        *body = bytes;
    }
    headers.push(Header::ContentLength(rsip::headers::ContentLength::new(
        body.len().to_string(),
    )));
}

/// One-line summary for logs
pub(crate) fn summary(headers: &Headers) -> String {
    let call_id = call_id(headers).unwrap_or("-");
    match cseq(headers) {
        Some((seq, method)) => format!("Call-ID {} CSeq {} {}", call_id, seq, method),
        None => format!("Call-ID {}", call_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::SipMessage;

    const INVITE: &str = "INVITE sip:alice@127.0.0.1:5070 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKinv1\r\n\
        Max-Forwards: 70\r\n\
        From: <sip:carrier@10.0.0.5>;tag=caller1\r\n\
        To: <sip:alice@127.0.0.1>\r\n\
        Call-ID: call-1@10.0.0.5\r\n\
        CSeq: 1 INVITE\r\n\
        Content-Length: 0\r\n\r\n";

    fn invite() -> Request {
        match SipMessage::try_from(INVITE.as_bytes()).unwrap() {
            SipMessage::Request(request) => request,
            SipMessage::Response(_) => panic!("expected request"),
        }
    }

    #[test]
    fn test_header_access() {
        let request = invite();
        assert_eq!(call_id(&request.headers), Some("call-1@10.0.0.5"));
        assert_eq!(cseq(&request.headers), Some((1, "INVITE".to_string())));
        assert!(!has_authorization(&request.headers));
    }

    #[test]
    fn test_response_copies_transaction_headers() {
        let request = invite();
        let mut response = response_for(&request, StatusCode::Ringing, Some("bot42"));
        set_body(&mut response.headers, &mut response.body, None);

        assert_eq!(response.status_code.code(), 180);
        assert_eq!(call_id(&response.headers), Some("call-1@10.0.0.5"));
        assert_eq!(cseq(&response.headers), Some((1, "INVITE".to_string())));

        let wire = SipMessage::Response(response).to_string();
        assert!(wire.starts_with("SIP/2.0 180"));
        assert!(wire.contains("branch=z9hG4bKinv1"));
        assert!(wire.contains(";tag=bot42"));
        assert!(wire.contains("Content-Length: 0"));
    }

    #[test]
    fn test_name_addr() {
        assert_eq!(name_addr("", "sip:a@b"), "<sip:a@b>");
        assert_eq!(name_addr("Alice", "sip:a@b"), "\"Alice\" <sip:a@b>");
    }
}
