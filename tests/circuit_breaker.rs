use std::time::Duration;

use tooldock::{CircuitBreaker, CircuitState, ToolError};

mod common;

#[tokio::test]
async fn breaker_trip_and_recovery_scenario() {
    common::init_tracing();
    let breaker = CircuitBreaker::new(3, Duration::from_millis(100));

    // Three consecutive failures open the circuit.
    for _ in 0..3 {
        let outcome: Result<(), ToolError> = breaker
            .call(|| async { Err(ToolError::execution("dependency down")) })
            .await;
        assert!(outcome.is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // The fourth call is rejected with a retryable CIRCUIT_OPEN error.
    let err = breaker
        .call(|| async { Ok::<(), ToolError>(()) })
        .await
        .unwrap_err();
    assert_eq!(err.code, "CIRCUIT_OPEN");
    assert!(err.retryable);
    assert!(err.retry_after.unwrap() <= Duration::from_millis(100));

    // After the reset timeout a successful probe closes the circuit.
    tokio::time::sleep(Duration::from_millis(150)).await;
    breaker
        .call(|| async { Ok::<(), ToolError>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failures(), 0);
}

#[tokio::test]
async fn successes_after_reset_leave_the_breaker_closed() {
    common::init_tracing();
    let breaker = CircuitBreaker::new(1, Duration::from_millis(50));
    let _ = breaker
        .call(|| async { Err::<(), _>(ToolError::execution("boom")) })
        .await;
    assert_eq!(breaker.state(), CircuitState::Open);

    breaker.reset();
    for _ in 0..5 {
        breaker
            .call(|| async { Ok::<(), ToolError>(()) })
            .await
            .unwrap();
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failures(), 0);
}
