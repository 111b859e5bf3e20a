//! Background task keeping the key set fresh.

// crates.io
use tokio::{sync::watch, task::JoinHandle, time};
// self
use crate::{_prelude::*, cache::manager::KeySetCache};

const MIN_WAKE_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to a running refresher; the task stops on [`RefresherHandle::shutdown`] or drop.
#[derive(Debug)]
pub struct RefresherHandle {
	cancel: watch::Sender<bool>,
	task: Option<JoinHandle<()>>,
}
impl RefresherHandle {
	/// Signal the task to stop and wait for it to exit.
	pub async fn shutdown(mut self) {
		let _ = self.cancel.send(true);

		if let Some(task) = self.task.take()
			&& let Err(err) = task.await
		{
			tracing::warn!(error = %err, "key set refresher did not exit cleanly");
		}
	}

	/// Whether the task has exited.
	pub fn is_finished(&self) -> bool {
		self.task.as_ref().is_none_or(JoinHandle::is_finished)
	}
}
impl Drop for RefresherHandle {
	fn drop(&mut self) {
		let _ = self.cancel.send(true);
	}
}

pub(crate) fn spawn(cache: KeySetCache) -> RefresherHandle {
	let (cancel, mut cancelled) = watch::channel(false);
	let task = tokio::spawn(async move {
		tracing::debug!(source = %cache.source().name, "key set refresher started");

		loop {
			let delay = cache.next_refresh_in().await.max(MIN_WAKE_INTERVAL);

			tokio::select! {
				changed = cancelled.changed() => {
					if changed.is_err() || *cancelled.borrow() {
						break;
					}
				},
				_ = time::sleep(delay) => {
					if let Err(err) = cache.refresh_due().await {
						tracing::warn!(error = %err, "scheduled key set refresh failed");
					}
				},
			}
		}

		tracing::debug!(source = %cache.source().name, "key set refresher stopped");
	});

	RefresherHandle { cancel, task: Some(task) }
}
