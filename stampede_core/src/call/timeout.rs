use crate::call::{Call, CallDecorator, CallError, CallInput};
use crate::config::{ConfigError, Options};
use crate::issue::{Outcome, TIME};
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

const UNINITIALIZED: i32 = -1;

/// A 32-bit integer in anonymous shared memory.
///
/// The mapping is inherited by forked children, so helper processes spawned
/// while reducing one issue observe and update the same value.
pub struct SharedCell {
    ptr: NonNull<AtomicI32>,
}

// SAFETY: the cell is only ever accessed through atomic operations.
unsafe impl Send for SharedCell {}
// SAFETY: see above.
unsafe impl Sync for SharedCell {}

impl SharedCell {
    pub fn new(value: i32) -> io::Result<Self> {
        let size = std::mem::size_of::<AtomicI32>();
        // SAFETY: anonymous shared mapping with no file descriptor; the result is checked below.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(raw.cast::<AtomicI32>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        // SAFETY: the mapping is page aligned, large enough, and exclusively ours until shared.
        unsafe { ptr.as_ptr().write(AtomicI32::new(value)) };
        Ok(Self { ptr })
    }

    fn cell(&self) -> &AtomicI32 {
        // SAFETY: the pointer stays valid until `drop` unmaps it.
        unsafe { self.ptr.as_ref() }
    }

    pub fn load(&self) -> i32 {
        self.cell().load(Ordering::SeqCst)
    }

    pub fn store(&self, value: i32) {
        self.cell().store(value, Ordering::SeqCst);
    }
}

impl Drop for SharedCell {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the region mapped in `new`.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), std::mem::size_of::<AtomicI32>());
        }
    }
}

/// `ceil(sqrt(time * timeout))`, clamped to `[1, max]`.
pub fn adapt(time: f64, timeout: i32, max: i32) -> i32 {
    let adapted = (time.max(0.0) * f64::from(timeout)).sqrt().ceil();
    (adapted as i32).clamp(1, max.max(1))
}

/// Shrinks the timeout of repeated calls toward the running time of the
/// issue being replayed.
///
/// `init` captures the base call's `timeout` option. On the first call the
/// cell is seeded from the hint's `time` (or the initial timeout). After each
/// call that reproduces the same issue id, the cell is tightened to
/// `ceil(sqrt(time * current))`, never below 1 second or above the initial
/// timeout.
#[derive(Default)]
pub struct AdaptiveTimeoutDecorator {
    initial: Option<i32>,
    cell: Option<SharedCell>,
}

impl AdaptiveTimeoutDecorator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<i32> {
        self.cell.as_ref().map(SharedCell::load)
    }
}

impl CallDecorator for AdaptiveTimeoutDecorator {
    fn init(&mut self, base_options: &mut Options) -> Result<(), ConfigError> {
        let timeout = match base_options.get("timeout") {
            None => return Ok(()),
            Some(toml::Value::Integer(i)) => *i as f64,
            Some(toml::Value::Float(f)) => *f,
            Some(toml::Value::String(s)) => s.trim().parse().map_err(|_| ConfigError::Options {
                plugin: "AdaptiveTimeoutDecorator".to_string(),
                message: format!("timeout '{s}' is not a number"),
            })?,
            Some(other) => {
                return Err(ConfigError::Options {
                    plugin: "AdaptiveTimeoutDecorator".to_string(),
                    message: format!("timeout {other} is not a number"),
                });
            }
        };
        if timeout <= 0.0 {
            return Ok(());
        }
        let initial = timeout.ceil() as i32;
        let cell = SharedCell::new(UNINITIALIZED).map_err(|e| ConfigError::Options {
            plugin: "AdaptiveTimeoutDecorator".to_string(),
            message: format!("cannot allocate shared timeout: {e}"),
        })?;
        self.initial = Some(initial);
        self.cell = Some(cell);
        Ok(())
    }

    fn call(&mut self, inner: &mut dyn Call, mut input: CallInput) -> Result<Outcome, CallError> {
        let (Some(initial), Some(cell)) = (self.initial, self.cell.as_ref()) else {
            return inner.call(input);
        };

        let mut adapted = cell.load();
        if adapted == UNINITIALIZED {
            adapted = match input.hints.get(TIME).and_then(|t| t.as_f64()) {
                Some(time) => adapt(time, initial, initial),
                None => initial,
            };
            cell.store(adapted);
        }
        input.timeout = Some(Duration::from_secs(adapted as u64));

        let hint_id = input.hints.id().map(|id| id.into_owned());
        let outcome = inner.call(input)?;

        if let Outcome::Issue(issue) = &outcome {
            let same = hint_id.is_some() && issue.id().as_deref() == hint_id.as_deref();
            if let (true, Some(time)) = (same, issue.get(TIME).and_then(|t| t.as_f64())) {
                cell.store(adapt(time, cell.load(), initial));
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{FnCall, decorate};
    use crate::issue::{ID, Issue};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_adapt_formula_and_clamping() {
        assert_eq!(adapt(4.0, 16, 16), 8);
        assert_eq!(adapt(0.0, 16, 16), 1, "Never below one second");
        assert_eq!(adapt(100.0, 16, 16), 16, "Never above the initial timeout");
        assert_eq!(adapt(0.5, 10, 10), 3);
    }

    #[test]
    fn test_shared_cell_round_trip() {
        let cell = SharedCell::new(-1).unwrap();
        assert_eq!(cell.load(), -1);
        cell.store(42);
        assert_eq!(cell.load(), 42);
    }

    #[test]
    fn test_timeout_tightens_on_reproduction() {
        let seen: Arc<Mutex<Vec<Option<Duration>>>> = Arc::default();
        let recorder = seen.clone();
        let base = FnCall(move |input: CallInput| {
            recorder.lock().unwrap().push(input.timeout);
            Ok(Outcome::Issue(Issue::new().with(ID, "crash").with(TIME, 1.0)))
        });

        let mut decorator = AdaptiveTimeoutDecorator::new();
        let mut options: Options = toml::from_str("timeout = 16").unwrap();
        decorator.init(&mut options).unwrap();
        let mut call = decorate(Box::new(base), vec![Box::new(decorator)]);

        let hints = Issue::new().with(ID, "crash").with(TIME, 4.0);
        call.call(CallInput::with_hints(b"x".to_vec(), hints.clone())).unwrap();
        call.call(CallInput::with_hints(b"x".to_vec(), hints)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], Some(Duration::from_secs(8)), "Seeded from the hint time");
        assert_eq!(seen[1], Some(Duration::from_secs(3)), "ceil(sqrt(1 * 8)) after reproduction");
    }

    #[test]
    fn test_without_timeout_option_is_transparent() {
        let mut decorator = AdaptiveTimeoutDecorator::new();
        let mut options = Options::new();
        decorator.init(&mut options).unwrap();
        assert!(decorator.current().is_none());
        let mut call = decorate(
            Box::new(FnCall(|input: CallInput| {
                assert!(input.timeout.is_none());
                Ok(Outcome::Empty)
            })),
            vec![Box::new(decorator)],
        );
        call.call(CallInput::new(Vec::new())).unwrap();
    }
}
