use webhook_engine::{sign, verify_webhook_request, VerificationError, SIGNATURE_HEADER};

/// What a subscriber does with an incoming request.
fn main() {
    let secret = "supersecret";
    let body = br#"{"event_type":"message_received","message":{"content":"urgent"}}"#;

    let Some(signature) = sign(body, Some(secret)) else {
        eprintln!("no secret configured; request would be unsigned");
        return;
    };
    let headers = [("Content-Type", "application/json"), (SIGNATURE_HEADER, signature.as_str())];

    match verify_webhook_request(headers, body, secret.as_bytes()) {
        Ok(()) => println!("signature valid: {signature}"),
        Err(VerificationError::MissingSignature) => println!("missing {SIGNATURE_HEADER}"),
        Err(VerificationError::InvalidSignature) => println!("signature mismatch"),
    }

    let tampered = br#"{"event_type":"message_received","message":{"content":"relax"}}"#;
    assert_eq!(
        verify_webhook_request(headers, tampered, secret.as_bytes()),
        Err(VerificationError::InvalidSignature)
    );
}
