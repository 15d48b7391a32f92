use std::sync::{
	Arc,
	Condvar,
	Mutex,
	MutexGuard,
};

// Poisoning is ignored. No critical section in this crate can leave the guarded data inconsistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A signal that fires at most once and can be waited on.
///
/// Firing it more than once, from any number of threads, has the same effect as firing it once.
#[derive(Debug, Default)]
pub(crate) struct CloseLatch {
	fired: Mutex<bool>,
	condvar: Condvar,
}

impl CloseLatch {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Fires the latch. Returns true if this call is the one that fired it.
	pub fn fire(&self) -> bool {
		let mut fired = lock(&self.fired);

		if *fired {
			return false;
		}

		*fired = true;
		self.condvar.notify_all();
		true
	}

	pub fn is_fired(&self) -> bool {
		*lock(&self.fired)
	}

	/// Blocks until the latch has fired.
	pub fn wait(&self) {
		let mut fired = lock(&self.fired);

		while !*fired {
			fired = self.condvar.wait(fired).unwrap_or_else(|poisoned| poisoned.into_inner());
		}
	}
}

/// Fires a [`CloseLatch`] when dropped.
#[derive(Debug)]
pub(crate) struct CloseGuard(pub Arc<CloseLatch>);

impl Drop for CloseGuard {
	fn drop(&mut self) {
		self.0.fire();
	}
}

/// Counts running tasks and lets other threads wait until there are none.
#[derive(Debug, Default)]
pub(crate) struct WaitGroup {
	count: Mutex<usize>,
	condvar: Condvar,
}

impl WaitGroup {
	/// Registers one task. The task is finished when the returned token is dropped, even if the task panics.
	pub fn add(self: &Arc<Self>) -> WaitGroupToken {
		*lock(&self.count) += 1;
		WaitGroupToken(Arc::clone(self))
	}

	pub fn wait(&self) {
		let mut count = lock(&self.count);

		while *count != 0 {
			count = self.condvar.wait(count).unwrap_or_else(|poisoned| poisoned.into_inner());
		}
	}
}

#[derive(Debug)]
pub(crate) struct WaitGroupToken(Arc<WaitGroup>);

impl Drop for WaitGroupToken {
	fn drop(&mut self) {
		let mut count = lock(&self.0.count);
		*count -= 1;

		if *count == 0 {
			self.0.condvar.notify_all();
		}
	}
}
