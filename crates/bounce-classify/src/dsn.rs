use mailparse::{parse_headers, parse_mail, ParsedMail};

fn is_delivery_status(part: &ParsedMail) -> bool {
    part.ctype.mimetype == "message/delivery-status"
        || part.ctype.mimetype == "message/global-delivery-status"
}

fn is_plain_text(part: &ParsedMail) -> bool {
    part.ctype.mimetype == "text/plain"
}

fn find_part<'a, 'b>(
    part: &'a ParsedMail<'b>,
    pred: &impl Fn(&ParsedMail) -> bool,
) -> Option<&'a ParsedMail<'b>> {
    if pred(part) {
        return Some(part);
    }
    part.subparts.iter().find_map(|sub| find_part(sub, pred))
}

/// Pull the most specific field out of a delivery-status body.
/// Diagnostic-Code wins over Status; header unfolding takes care
/// of continuation lines.
fn diagnostic_from_status(body: &str) -> Option<String> {
    let body = body.replace("\r\n", "\n");
    let mut status = None;

    for section in body.trim().split("\n\n") {
        let Ok((headers, _)) = parse_headers(section.as_bytes()) else {
            continue;
        };
        for hdr in headers {
            let name = hdr.get_key_ref().to_ascii_lowercase();
            let value = hdr.get_value();
            match name.as_str() {
                "diagnostic-code" => {
                    // "smtp; 550 5.1.1 user unknown"
                    let text = match value.split_once(';') {
                        Some((_type, text)) => text,
                        None => value.as_str(),
                    };
                    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
                    if !text.is_empty() {
                        return Some(text);
                    }
                }
                "status" if status.is_none() => {
                    let value = value.trim().to_string();
                    if !value.is_empty() {
                        status.replace(value);
                    }
                }
                _ => {}
            }
        }
    }

    status
}

/// Extract the text that best describes why a bounced message failed.
/// A delivery-status part is preferred over a plain text explanation.
pub fn extract_bounce_text(raw: &[u8]) -> Option<String> {
    let mail = parse_mail(raw).ok()?;

    if let Some(part) = find_part(&mail, &is_delivery_status) {
        if let Some(text) = part
            .get_body()
            .ok()
            .and_then(|body| diagnostic_from_status(&body))
        {
            return Some(text);
        }
    }

    let plain = find_part(&mail, &is_plain_text)?;
    let body = plain.get_body().ok()?;
    let body = body.trim();
    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{BounceClassifier, BounceCode, BouncePair, BounceType};

    const DSN: &str = "From: MAILER-DAEMON@mx.example.net\r
To: bounces@example.com\r
Subject: Delivery Status Notification (Failure)\r
MIME-Version: 1.0\r
Content-Type: multipart/report; report-type=delivery-status; boundary=\"BOUNDARY\"\r
\r
--BOUNDARY\r
Content-Type: text/plain\r
\r
Your message could not be delivered. Quota exceeded 4.2.2\r
--BOUNDARY\r
Content-Type: message/delivery-status\r
\r
Reporting-MTA: dns; mx.example.net\r
\r
Final-Recipient: rfc822; nobody@example.net\r
Action: failed\r
Status: 5.1.1\r
Diagnostic-Code: smtp; 550 5.1.1 <nobody@example.net>:\r
 Recipient address rejected: User unknown\r
--BOUNDARY--\r
";

    #[test]
    fn prefers_diagnostic_code() {
        k9::assert_equal!(
            extract_bounce_text(DSN.as_bytes()),
            Some(
                "550 5.1.1 <nobody@example.net>: Recipient address rejected: User unknown"
                    .to_string()
            )
        );
        k9::assert_equal!(
            BounceClassifier::default().classify_bounce_email(DSN.as_bytes()),
            BouncePair::new(BounceType::Hard, BounceCode::BadEmailAddress)
        );
    }

    #[test]
    fn falls_back_to_status() {
        let dsn = DSN.replace(
            "Diagnostic-Code: smtp; 550 5.1.1 <nobody@example.net>:\r\n Recipient address rejected: User unknown\r\n",
            "",
        );
        let dsn = dsn.replace("Status: 5.1.1", "Status: 4.2.2");
        k9::assert_equal!(extract_bounce_text(dsn.as_bytes()), Some("4.2.2".to_string()));
        k9::assert_equal!(
            BounceClassifier::default().classify_bounce_email(dsn.as_bytes()),
            BouncePair::new(BounceType::Soft, BounceCode::MailboxFull)
        );
    }

    #[test]
    fn plain_text_bounce() {
        let raw = "From: postmaster@example.net\r\nSubject: failure\r\n\r\n550 mailbox unavailable\r\n";
        k9::assert_equal!(
            extract_bounce_text(raw.as_bytes()),
            Some("550 mailbox unavailable".to_string())
        );
        k9::assert_equal!(
            BounceClassifier::default().classify_bounce_email(raw.as_bytes()),
            BouncePair::new(BounceType::Hard, BounceCode::BadEmailAddress)
        );
    }
}
