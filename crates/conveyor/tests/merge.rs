//! Fan-out / fan-in integration tests

use std::time::Duration;

use conveyor_engine::{
    fan_in, fan_out, fan_out_indexed, reordered, CancelCause, CancellationToken, EngineError,
};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::time::sleep;

#[test_log::test(tokio::test)]
async fn test_fan_in_yields_every_item_of_every_source() {
    let token = CancellationToken::new();
    let sizes = [0usize, 3, 7, 1];
    let sources: Vec<BoxStream<'static, (usize, usize)>> = sizes
        .iter()
        .enumerate()
        .map(|(source, &size)| stream::iter((0..size).map(move |i| (source, i))).boxed())
        .collect();

    let mut items: Vec<(usize, usize)> = fan_in(sources, &token).collect().await;
    items.sort_unstable();

    assert_eq!(items.len(), sizes.iter().sum::<usize>());
    for (source, &size) in sizes.iter().enumerate() {
        let seen: Vec<usize> = items
            .iter()
            .filter(|(s, _)| *s == source)
            .map(|(_, i)| *i)
            .collect();
        assert_eq!(seen, (0..size).collect::<Vec<_>>());
    }
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_fan_in_then_reorder_restores_input_order() {
    let token = CancellationToken::new();
    let input = stream::iter(0..40u64).map(|n| (n, n));

    // Later items finish first, so the merge is out of order.
    let outputs = fan_out(input, 4, &token, |(seq, n): (u64, u64)| async move {
        sleep(Duration::from_millis(40 - n)).await;
        anyhow::Ok((seq, n * 10))
    })
    .unwrap();
    assert_eq!(outputs.len(), 4);

    let merged = outputs.merge().map(|item| item.unwrap());
    let ordered: Vec<u64> = reordered(merged).collect().await;
    assert_eq!(ordered, (0..40).map(|n| n * 10).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_failed_item_does_not_hold_back_the_rest() {
    let token = CancellationToken::new();
    let outputs = fan_out_indexed(stream::iter(0..10u64), 3, &token, |n: u64| async move {
        sleep(Duration::from_millis(10 - n)).await;
        anyhow::ensure!(n != 2, "rejected {n}");
        anyhow::Ok(n)
    })
    .unwrap();

    let ordered: Vec<_> = reordered(outputs.merge()).collect().await;
    assert_eq!(ordered.len(), 10);
    for (n, item) in ordered.into_iter().enumerate() {
        if n == 2 {
            assert_eq!(item, Err(EngineError::Handler("rejected 2".into())));
        } else {
            assert_eq!(item, Ok(n as u64));
        }
    }
}

#[test_log::test(tokio::test)]
async fn test_reordered_keeps_successes_after_a_dropped_item() {
    let token = CancellationToken::new();
    let input = stream::iter(0..10u64).map(|n| (n, n));
    let outputs = fan_out(input, 3, &token, |(seq, n): (u64, u64)| async move {
        anyhow::ensure!(n != 2, "rejected {n}");
        anyhow::Ok((seq, n))
    })
    .unwrap();

    // The failed item loses its sequence number, leaving a gap at 2.
    let merged = outputs.merge().filter_map(|item| async move { item.ok() });
    let ordered: Vec<u64> = reordered(merged).collect().await;
    assert_eq!(ordered, vec![0, 1, 3, 4, 5, 6, 7, 8, 9]);
}

#[test_log::test(tokio::test)]
async fn test_fan_out_isolates_failures() {
    let token = CancellationToken::new();
    let outputs = fan_out(stream::iter(0..10u32), 3, &token, |n: u32| async move {
        if n == 3 {
            panic!("cannot handle {n}");
        }
        if n == 6 {
            anyhow::bail!("rejected {n}");
        }
        anyhow::Ok(n)
    })
    .unwrap();

    let results: Vec<_> = outputs.merge().collect().await;
    assert_eq!(results.len(), 10);

    let mut values: Vec<u32> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    values.sort_unstable();
    assert_eq!(values, vec![0, 1, 2, 4, 5, 7, 8, 9]);

    let panics = results
        .iter()
        .filter(|r| matches!(r, Err(EngineError::HandlerPanic(_))))
        .count();
    let failures = results
        .iter()
        .filter(|r| matches!(r, Err(EngineError::Handler(_))))
        .count();
    assert_eq!((panics, failures), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_fan_out_and_fan_in() {
    let token = CancellationToken::new();
    let outputs = fan_out(stream::iter(0..1_000u32), 2, &token, |n: u32| async move {
        sleep(Duration::from_millis(10)).await;
        anyhow::Ok(n)
    })
    .unwrap();
    let mut merged = outputs.merge();

    let mut received = 0;
    while let Some(item) = merged.next().await {
        item.unwrap();
        received += 1;
        if received == 5 {
            token.fire(CancelCause::UserCancel);
        }
    }

    assert!(received >= 5);
    assert!(received < 1_000);
}

#[test_log::test(tokio::test)]
async fn test_fan_out_requires_a_worker() {
    let token = CancellationToken::new();
    let err = fan_out(stream::iter(0..3u8), 0, &token, |n: u8| async move {
        anyhow::Ok(n)
    })
    .err()
    .unwrap();
    assert!(matches!(err, EngineError::InvalidConfig(_)));
}
