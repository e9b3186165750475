//! Tests for request/response types

use rill_types::{CompletionReason, InferenceRequest, Priority, StreamToken};
use std::time::Duration;

#[test]
fn request_defaults() {
    let req = InferenceRequest::new("gpt2", "hello");
    assert_eq!(req.max_tokens, 100);
    assert!((req.temperature - 1.0).abs() < f32::EPSILON);
    assert!((req.top_p - 0.95).abs() < f32::EPSILON);
    assert_eq!(req.priority, Priority::Normal);
    assert_eq!(req.timeout, Duration::from_secs(30));
    assert!(req.client_id.is_none());
    assert!(req.validate().is_ok());
}

#[test]
fn request_validation_bounds() {
    let req = InferenceRequest::new("gpt2", "hi").with_max_tokens(0);
    assert!(req.validate().is_err());

    let mut req = InferenceRequest::new("gpt2", "hi");
    req.temperature = -0.1;
    assert!(req.validate().is_err());

    // Zero temperature is accepted.
    let mut req = InferenceRequest::new("gpt2", "hi");
    req.temperature = 0.0;
    assert!(req.validate().is_ok());

    let mut req = InferenceRequest::new("gpt2", "hi");
    req.top_p = 1.5;
    assert!(req.validate().is_err());

    let req = InferenceRequest::new("gpt2", "hi").with_timeout(Duration::ZERO);
    assert!(req.validate().is_err());

    let req = InferenceRequest::new("", "hi");
    assert!(req.validate().is_err());

    // Empty prompt is accepted; whether it makes sense is the model's call.
    let req = InferenceRequest::new("gpt2", "");
    assert!(req.validate().is_ok());
}

#[test]
fn priority_parsing() {
    assert_eq!(Priority::parse("HIGH").unwrap(), Priority::High);
    assert_eq!(Priority::parse("NORMAL").unwrap(), Priority::Normal);
    assert_eq!(Priority::parse("LOW").unwrap(), Priority::Low);
    assert!(Priority::parse("urgent").is_err());
    assert!(Priority::parse("high").is_err());
}

#[test]
fn priority_strict_ordering() {
    assert!(Priority::High > Priority::Normal);
    assert!(Priority::Normal > Priority::Low);
}

#[test]
fn stream_token_serialization_round_trip() {
    let token = StreamToken::new("hello", 42).with_logprob(-0.5);
    let json = serde_json::to_string(&token).unwrap();
    let back: StreamToken = serde_json::from_str(&json).unwrap();
    assert_eq!(token, back);

    // Optional fields are omitted from the wire form when unset.
    let plain = StreamToken::new("x", 1);
    let json = serde_json::to_string(&plain).unwrap();
    assert!(!json.contains("logprob"));
    assert!(!json.contains("end_of_stream"));
    assert!(!json.contains("is_special"));
}

#[test]
fn end_marker_token() {
    let end = StreamToken::end_marker();
    assert!(end.end_of_stream);
    assert!(end.is_special);
    assert!(end.token.is_empty());
}

#[test]
fn completion_reason_wire_form() {
    assert_eq!(
        serde_json::to_string(&CompletionReason::Done).unwrap(),
        "\"done\""
    );
    assert_eq!(
        serde_json::to_string(&CompletionReason::Timeout).unwrap(),
        "\"timeout\""
    );
    assert_eq!(CompletionReason::Error.as_str(), "error");
}
