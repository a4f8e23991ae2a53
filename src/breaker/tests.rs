use super::*;
use crate::errors::ToolError;

async fn failing_call(breaker: &CircuitBreaker) -> Result<(), ToolError> {
    breaker
        .call(|| async { Err::<(), _>(ToolError::execution("backend down")) })
        .await
}

async fn succeeding_call(breaker: &CircuitBreaker) -> Result<(), ToolError> {
    breaker.call(|| async { Ok(()) }).await
}

#[tokio::test]
async fn trips_after_threshold_failures() {
    let breaker = CircuitBreaker::new(3, Duration::from_millis(100));

    for _ in 0..3 {
        assert!(failing_call(&breaker).await.is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // The fourth call is rejected without invoking the closure.
    use std::sync::atomic::{AtomicBool, Ordering};
    let invoked = AtomicBool::new(false);
    let err = breaker
        .call(|| async {
            invoked.store(true, Ordering::SeqCst);
            Ok::<(), ToolError>(())
        })
        .await
        .unwrap_err();
    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(err.code, codes::CIRCUIT_OPEN);
    assert!(err.retryable);
    assert!(err.retry_after.unwrap() <= Duration::from_millis(100));
}

#[tokio::test]
async fn recovers_through_half_open_probe() {
    let breaker = CircuitBreaker::new(3, Duration::from_millis(100));
    for _ in 0..3 {
        let _ = failing_call(&breaker).await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(150)).await;
    succeeding_call(&breaker).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failures(), 0);
}

#[tokio::test]
async fn zero_threshold_trips_on_first_error() {
    let breaker = CircuitBreaker::new(0, Duration::from_secs(60));
    let _ = failing_call(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test]
async fn failed_probe_reopens_at_threshold() {
    let breaker = CircuitBreaker::new(1, Duration::from_millis(50));
    let _ = failing_call(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let _ = failing_call(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test]
async fn success_resets_failure_count_while_closed() {
    let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
    let _ = failing_call(&breaker).await;
    let _ = failing_call(&breaker).await;
    assert_eq!(breaker.failures(), 2);

    succeeding_call(&breaker).await.unwrap();
    assert_eq!(breaker.failures(), 0);

    // Two more failures do not reach the threshold of three.
    let _ = failing_call(&breaker).await;
    let _ = failing_call(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn reset_forces_closed() {
    let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
    let _ = failing_call(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    breaker.reset();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failures(), 0);
    succeeding_call(&breaker).await.unwrap();
}

#[tokio::test]
async fn successes_after_reset_keep_state_closed() {
    let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
    let _ = failing_call(&breaker).await;
    breaker.reset();

    for _ in 0..10 {
        succeeding_call(&breaker).await.unwrap();
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failures(), 0);
}

#[tokio::test]
async fn call_passes_through_the_inner_value() {
    let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
    let value = breaker.call(|| async { Ok::<_, ToolError>(41 + 1) }).await;
    assert_eq!(value.unwrap(), 42);
}

#[tokio::test]
async fn concurrent_calls_are_serialized_safely() {
    use std::sync::Arc;

    let breaker = Arc::new(CircuitBreaker::new(100, Duration::from_secs(60)));
    let mut handles = Vec::new();
    for i in 0..20 {
        let breaker = Arc::clone(&breaker);
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                let _ = succeeding_call(&breaker).await;
            } else {
                let _ = failing_call(&breaker).await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    // Threshold is far above the failure count; state must stay closed.
    assert_eq!(breaker.state(), CircuitState::Closed);
}
