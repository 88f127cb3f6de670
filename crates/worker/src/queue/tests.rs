use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::stream;
use parking_lot::Mutex;

use super::*;

/// Submits `count` operations that each block on their own gate.
fn submit_gated(queue: &RequestQueue, count: usize, started: &Arc<Mutex<Vec<usize>>>) -> (Vec<oneshot::Sender<()>>, Vec<Submission<usize>>) {
	let mut gates = Vec::new();
	let mut submissions = Vec::new();
	for id in 0..count {
		let (gate_tx, gate_rx) = oneshot::channel::<()>();
		gates.push(gate_tx);
		let started = Arc::clone(started);
		submissions.push(queue.submit(move || {
			started.lock().push(id);
			async move {
				let _ = gate_rx.await;
				id
			}
		}));
	}
	(gates, submissions)
}

#[tokio::test]
async fn never_exceeds_bound_and_starts_in_submission_order() {
	let queue = RequestQueue::new(2);
	let started = Arc::new(Mutex::new(Vec::new()));
	let (mut gates, mut submissions) = submit_gated(&queue, 5, &started);

	assert_eq!(*started.lock(), vec![0, 1]);
	assert_eq!(queue.in_flight(), 2);
	assert_eq!(queue.queued(), 3);

	// Finish op 1 first: the freed slot goes to op 2, not to whoever finishes.
	let _ = gates.remove(1).send(());
	assert_eq!(submissions.remove(1).await, Ok(1));
	assert_eq!(*started.lock(), vec![0, 1, 2]);
	assert_eq!(queue.in_flight(), 2);

	let _ = gates.remove(0).send(());
	assert_eq!(submissions.remove(0).await, Ok(0));
	assert_eq!(*started.lock(), vec![0, 1, 2, 3]);
	assert!(queue.in_flight() <= queue.max_requests());

	for gate in gates.drain(..) {
		let _ = gate.send(());
	}
	let mut results = Vec::new();
	for submission in submissions {
		results.push(submission.await.expect("operation result"));
	}
	assert_eq!(results, vec![2, 3, 4]);
	assert_eq!(*started.lock(), vec![0, 1, 2, 3, 4]);
	assert_eq!(queue.in_flight(), 0);
	assert_eq!(queue.queued(), 0);
}

#[tokio::test]
async fn peak_concurrency_matches_bound() {
	const MAX: usize = 3;
	const EXTRA: usize = 7;
	let queue = RequestQueue::new(MAX);
	let running = Arc::new(AtomicUsize::new(0));
	let peak = Arc::new(AtomicUsize::new(0));

	let submissions: Vec<_> = (0..MAX + EXTRA)
		.map(|i| {
			let running = Arc::clone(&running);
			let peak = Arc::clone(&peak);
			queue.submit(move || async move {
				let now = running.fetch_add(1, Ordering::SeqCst) + 1;
				peak.fetch_max(now, Ordering::SeqCst);
				tokio::task::yield_now().await;
				running.fetch_sub(1, Ordering::SeqCst);
				i
			})
		})
		.collect();

	for (i, submission) in submissions.into_iter().enumerate() {
		assert_eq!(submission.await, Ok(i));
	}
	assert_eq!(peak.load(Ordering::SeqCst), MAX);
}

#[tokio::test]
async fn errors_reach_the_submitter_unchanged() {
	let queue = RequestQueue::new(1);
	let failing = queue.submit(|| async { Err::<u32, &str>("offline") });
	let ok = queue.submit(|| async { Ok::<u32, &str>(7) });

	assert_eq!(failing.await, Ok(Err("offline")));
	assert_eq!(ok.await, Ok(Ok(7)));
}

#[tokio::test]
async fn panicking_operation_frees_its_slot() {
	let queue = RequestQueue::new(1);
	let boom = queue.submit(|| async {
		panic!("boom");
	});
	let next = queue.submit(|| async { 5u8 });

	assert_eq!(boom.await, Err::<(), _>(QueueError::Aborted));
	assert_eq!(next.await, Ok(5));
	assert_eq!(queue.in_flight(), 0);
}

#[tokio::test]
async fn panicking_factory_frees_its_slot() {
	let queue = RequestQueue::new(1);
	let started = Arc::new(Mutex::new(Vec::new()));
	let (mut gates, mut running) = submit_gated(&queue, 1, &started);

	let broken = queue.submit(|| -> std::future::Ready<u8> { panic!("factory") });
	let next = queue.submit(|| async { 3u8 });
	assert_eq!(queue.queued(), 2);

	let _ = gates.remove(0).send(());
	assert_eq!(running.remove(0).await, Ok(0));
	assert_eq!(broken.await, Err(QueueError::Aborted));
	let next = tokio::time::timeout(std::time::Duration::from_millis(200), next).await;
	assert_eq!(next.expect("slot was released"), Ok(3));
	assert_eq!(queue.in_flight(), 0);
}

#[tokio::test]
async fn factory_panic_on_an_idle_queue_stays_out_of_submit() {
	let queue = RequestQueue::new(1);
	let broken = queue.submit(|| -> std::future::Ready<u8> { panic!("factory") });
	assert_eq!(queue.in_flight(), 0);
	assert_eq!(broken.await, Err(QueueError::Aborted));
	assert_eq!(queue.submit(|| async { 4u8 }).await, Ok(4));
}

#[tokio::test]
async fn abandoned_submission_is_skipped() {
	let queue = RequestQueue::new(1);
	let started = Arc::new(Mutex::new(Vec::new()));
	let (mut gates, mut submissions) = submit_gated(&queue, 3, &started);

	// Op 1 is still waiting for a slot; dropping its handle means it never starts.
	drop(submissions.remove(1));
	let _ = gates.remove(0).send(());
	assert_eq!(submissions.remove(0).await, Ok(0));

	let _ = gates.remove(1).send(());
	assert_eq!(submissions.remove(0).await, Ok(2));
	assert_eq!(*started.lock(), vec![0, 2]);
}

#[tokio::test]
async fn stream_items_are_forwarded_and_slot_held_until_end() {
	let queue = RequestQueue::new(1);
	let (item_tx, item_rx) = mpsc::unbounded_channel::<u32>();
	let first = queue.submit_stream(move || {
		stream::unfold(item_rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
	});
	let second = queue.submit_stream(|| stream::iter(vec![10u32, 11]));

	item_tx.send(1).expect("stream open");
	item_tx.send(2).expect("stream open");
	assert_eq!(queue.in_flight(), 1);
	assert_eq!(queue.queued(), 1);

	let mut first = first;
	assert_eq!(first.next().await, Some(1));
	assert_eq!(first.next().await, Some(2));
	drop(item_tx);
	assert_eq!(first.next().await, None);

	let collected: Vec<u32> = second.collect().await;
	assert_eq!(collected, vec![10, 11]);
	assert_eq!(queue.in_flight(), 0);
}

#[test]
#[should_panic(expected = "max_requests must be > 0")]
fn zero_bound_is_rejected() {
	let _ = RequestQueue::new(0);
}
