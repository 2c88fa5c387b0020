use probe_session::AppError;

#[test]
fn display_prefixes_identify_the_kind() {
    let cases = [
        (AppError::Cancelled, "cancelled: operation was cancelled"),
        (
            AppError::DeadlineExceeded("detach did not complete".into()),
            "deadline exceeded: detach did not complete",
        ),
        (
            AppError::engine("not_supported", "child gating unavailable"),
            "engine: [not_supported] child gating unavailable",
        ),
        (
            AppError::InvalidState("session detached".into()),
            "invalid state: session detached",
        ),
        (
            AppError::InvalidArgument("unknown session event 'x'".into()),
            "invalid argument: unknown session event 'x'",
        ),
        (AppError::Protocol("bad line".into()), "protocol: bad line"),
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Io("broken pipe".into()), "io: broken pipe"),
    ];

    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn cancellation_and_deadline_are_distinguishable() {
    let cancelled = AppError::Cancelled;
    let deadline = AppError::DeadlineExceeded("late".into());

    assert!(cancelled.is_cancellation());
    assert!(!cancelled.is_deadline_exceeded());
    assert!(deadline.is_deadline_exceeded());
    assert!(!deadline.is_cancellation());
}

#[test]
fn io_errors_convert_to_io_variant() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
    let err: AppError = io.into();
    assert_eq!(err, AppError::Io("pipe closed".into()));
}

#[test]
fn json_errors_convert_to_protocol_variant() {
    let json = serde_json::from_str::<serde_json::Value>("{").expect_err("invalid json");
    let err: AppError = json.into();
    assert!(err.to_string().starts_with("protocol: malformed json"));
}
