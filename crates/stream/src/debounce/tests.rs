use std::time::Duration;

use futures::StreamExt;
use futures::channel::mpsc;
use tokio::time::Instant;

use super::*;
use crate::CoalesceExt;

type Item = Result<u32, &'static str>;

fn ms(n: u64) -> Duration {
	Duration::from_millis(n)
}

/// Sends `(offset_ms, value)` pairs on a schedule, then closes the source at `close_at` ms.
fn scripted(script: Vec<(u64, u32)>, close_at: u64) -> mpsc::UnboundedReceiver<Item> {
	let (tx, rx) = mpsc::unbounded();
	let start = Instant::now();
	tokio::spawn(async move {
		for (at, value) in script {
			tokio::time::sleep_until(start + ms(at)).await;
			let _ = tx.unbounded_send(Ok(value));
		}
		tokio::time::sleep_until(start + ms(close_at)).await;
	});
	rx
}

/// Collects `(value, elapsed_ms)` for every emission.
async fn collect_timed<S>(stream: S) -> Vec<(u32, u64)>
where
	S: Stream<Item = Item>,
{
	let start = Instant::now();
	let mut stream = std::pin::pin!(stream);
	let mut out = Vec::new();
	while let Some(item) = stream.next().await {
		out.push((item.expect("no errors scripted"), start.elapsed().as_millis() as u64));
	}
	out
}

#[tokio::test(start_paused = true)]
async fn burst_emits_only_the_last_value() {
	let source = scripted(vec![(0, 1), (10, 2), (20, 3), (30, 4), (40, 5), (250, 6)], 250);
	let emitted = collect_timed(source.debounce_latest(DebounceOptions::new(ms(50)))).await;

	// 5 fires 50ms after the burst ends; 6 is flushed when the source closes.
	assert_eq!(emitted, vec![(5, 90), (6, 250)]);
}

#[tokio::test(start_paused = true)]
async fn subsequent_delay_applies_after_first_emission() {
	let source = scripted(vec![(0, 1), (100, 2), (110, 3)], 400);
	let options = DebounceOptions::new(ms(20)).subsequent_delay(ms(80));
	let emitted = collect_timed(source.debounce_latest(options)).await;

	assert_eq!(emitted, vec![(1, 20), (3, 190)]);
}

#[tokio::test(start_paused = true)]
async fn zero_initial_delay_emits_first_value_immediately() {
	let source = scripted(vec![(0, 1), (5, 2), (10, 3)], 200);
	let options = DebounceOptions::new(ms(50)).initial_delay(Duration::ZERO);
	let emitted = collect_timed(source.debounce_latest(options)).await;

	assert_eq!(emitted, vec![(1, 0), (3, 60)]);
}

#[tokio::test(start_paused = true)]
async fn reduce_folds_window_left_to_right() {
	let source = scripted(vec![(0, 1), (10, 2), (20, 3), (300, 4), (310, 5)], 500);
	let reduced = source.debounce_reduce(DebounceOptions::new(ms(50)), |acc, next| acc * 10 + next);
	let emitted = collect_timed(reduced).await;

	assert_eq!(emitted, vec![(123, 70), (45, 360)]);
}

#[tokio::test(start_paused = true)]
async fn max_pending_forces_an_immediate_emission() {
	let (tx, rx) = mpsc::unbounded::<Item>();
	let mut out = rx.debounce_reduce(DebounceOptions::new(ms(100)).max_pending(3), |acc, next| acc + next);

	for value in [1, 2, 3, 4] {
		tx.unbounded_send(Ok(value)).expect("receiver alive");
	}
	// 1 + 2 + 3 hits the limit without waiting.
	assert_eq!(out.next().await, Some(Ok(6)));
	assert!(!out.has_pending());

	drop(tx);
	assert_eq!(out.next().await, Some(Ok(4)));
	assert_eq!(out.next().await, None);
}

#[tokio::test(start_paused = true)]
async fn skip_predicate_bypasses_the_delay() {
	let source = scripted(vec![(0, 10), (100, 11), (110, 500), (120, 501)], 400);
	let out = source
		.debounce_latest(DebounceOptions::new(ms(50)))
		.skip_delay_when(|last: Option<&u32>, next: &u32| last.is_some_and(|last| next.abs_diff(*last) > 100));
	let emitted = collect_timed(out).await;

	// 500 jumps far from the last emitted 10, so it goes out at once.
	assert_eq!(emitted, vec![(10, 50), (500, 110), (501, 170)]);
}

#[tokio::test(start_paused = true)]
async fn error_discards_the_pending_value() {
	let (tx, rx) = mpsc::unbounded::<Item>();
	let mut out = rx.debounce_reduce(DebounceOptions::new(ms(50)), |acc, next| acc + next);

	tx.unbounded_send(Ok(1)).expect("receiver alive");
	tx.unbounded_send(Ok(2)).expect("receiver alive");
	tx.unbounded_send(Err("boom")).expect("receiver alive");

	assert_eq!(out.next().await, Some(Err("boom")));
	assert_eq!(out.next().await, None);
	assert!(!out.has_pending());
}

#[tokio::test(start_paused = true)]
async fn values_after_an_error_are_never_emitted() {
	let (tx, rx) = mpsc::unbounded::<Item>();
	let mut out = rx.debounce_latest(DebounceOptions::new(ms(50)));

	tx.unbounded_send(Err("boom")).expect("receiver alive");
	assert_eq!(out.next().await, Some(Err("boom")));

	// The source keeps going, but the debounced stream has terminated.
	tx.unbounded_send(Ok(7)).expect("receiver alive");
	assert_eq!(out.next().await, None);
	tokio::time::sleep(ms(100)).await;
	assert_eq!(out.next().await, None);
	assert!(!out.has_pending());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_stream_releases_the_source() {
	let (tx, rx) = mpsc::unbounded::<Item>();
	let mut out = rx.debounce_latest(DebounceOptions::new(ms(50)));
	tx.unbounded_send(Ok(1)).expect("receiver alive");

	let early = tokio::time::timeout(ms(10), out.next()).await;
	assert!(early.is_err(), "value must still be pending");
	assert!(out.has_pending());

	drop(out);
	assert!(tx.is_closed());
}
