use webhook_engine::{compute_signature, verify_webhook_request};

fn main() {
    let payload = br#"{"id":"doc_42","title":"Q3 plan"}"#;
    let signature = compute_signature(b"supersecret", payload);

    let headers = vec![
        ("Content-Type", "application/json"),
        ("X-Webhook-Event", "document.updated"),
        ("X-Signature", signature.as_str()),
    ];

    match verify_webhook_request(headers.iter().map(|(k, v)| (*k, *v)), payload, b"supersecret") {
        Ok(()) => println!("signature ok"),
        Err(err) => println!("rejected: {:?}", err),
    }
}
