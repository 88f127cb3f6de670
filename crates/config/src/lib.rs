//! Configuration for waymark primitives.
//!
//! Configuration is written in TOML. Every section and field is optional and
//! falls back to a default; durations are given in milliseconds.
//!
//! ```toml
//! [debounce]
//! delay_ms = 300
//! initial_delay_ms = 0
//! max_pending = 50
//!
//! [write_buffer]
//! initial_delay_ms = 1000
//! subsequent_delay_ms = 100
//! chunk_size = 100
//!
//! [requests]
//! max_in_flight = 4
//! ```

pub mod error;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use waymark_store::WriteBufferOptions;
use waymark_stream::DebounceOptions;
use waymark_worker::RequestQueue;

pub use error::{ConfigError, Result};

/// Parsed configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaymarkConfig {
	#[serde(default)]
	pub debounce: DebounceConfig,
	#[serde(default)]
	pub write_buffer: WriteBufferConfig,
	#[serde(default)]
	pub requests: RequestsConfig,
}

/// `[debounce]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebounceConfig {
	/// Quiet window after the first emission.
	#[serde(default = "default_debounce_delay")]
	pub delay_ms: u64,
	/// Quiet window before the first emission. Defaults to `delay_ms`.
	#[serde(default)]
	pub initial_delay_ms: Option<u64>,
	/// Forces an emission after this many values.
	#[serde(default)]
	pub max_pending: Option<usize>,
}

fn default_debounce_delay() -> u64 {
	300
}

impl Default for DebounceConfig {
	fn default() -> Self {
		Self {
			delay_ms: default_debounce_delay(),
			initial_delay_ms: None,
			max_pending: None,
		}
	}
}

impl DebounceConfig {
	/// Converts to operator options; `initial_delay_ms` falls back to `delay_ms`.
	pub fn options(&self) -> DebounceOptions {
		let delay = Duration::from_millis(self.delay_ms);
		let initial = self.initial_delay_ms.map_or(delay, Duration::from_millis);
		let options = DebounceOptions::new(delay).initial_delay(initial);
		match self.max_pending {
			Some(count) => options.max_pending(count),
			None => options,
		}
	}
}

/// `[write_buffer]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBufferConfig {
	#[serde(default = "default_initial_flush_delay")]
	pub initial_delay_ms: u64,
	#[serde(default = "default_subsequent_flush_delay")]
	pub subsequent_delay_ms: u64,
	/// Entries persisted per table write.
	#[serde(default = "default_chunk_size")]
	pub chunk_size: usize,
}

fn default_initial_flush_delay() -> u64 {
	1_000
}

fn default_subsequent_flush_delay() -> u64 {
	100
}

fn default_chunk_size() -> usize {
	100
}

impl Default for WriteBufferConfig {
	fn default() -> Self {
		Self {
			initial_delay_ms: default_initial_flush_delay(),
			subsequent_delay_ms: default_subsequent_flush_delay(),
			chunk_size: default_chunk_size(),
		}
	}
}

impl WriteBufferConfig {
	/// Converts to buffer options.
	pub fn options(&self) -> WriteBufferOptions {
		WriteBufferOptions::default()
			.initial_delay(Duration::from_millis(self.initial_delay_ms))
			.subsequent_delay(Duration::from_millis(self.subsequent_delay_ms))
			.chunk_size(self.chunk_size)
	}
}

/// `[requests]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestsConfig {
	/// Upper bound on concurrently running requests.
	#[serde(default = "default_max_in_flight")]
	pub max_in_flight: usize,
}

fn default_max_in_flight() -> usize {
	4
}

impl Default for RequestsConfig {
	fn default() -> Self {
		Self {
			max_in_flight: default_max_in_flight(),
		}
	}
}

impl RequestsConfig {
	/// Builds a queue bounded by `max_in_flight`.
	pub fn queue(&self) -> RequestQueue {
		RequestQueue::new(self.max_in_flight)
	}
}

impl WaymarkConfig {
	/// Parses and validates a TOML document.
	pub fn parse(input: &str) -> Result<Self> {
		let config: Self = toml::from_str(input)?;
		config.validate()?;
		Ok(config)
	}

	/// Reads, parses and validates the file at `path`.
	pub fn load(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let input = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		let config = Self::parse(&input)?;
		tracing::debug!(path = %path.display(), "config.loaded");
		Ok(config)
	}

	/// Rejects values the primitives cannot be built with.
	///
	/// The option conversions panic on these values, so call this first when
	/// building a config by hand.
	pub fn validate(&self) -> Result<()> {
		if self.debounce.max_pending == Some(0) {
			return Err(invalid("debounce.max_pending"));
		}
		if self.write_buffer.chunk_size == 0 {
			return Err(invalid("write_buffer.chunk_size"));
		}
		if self.requests.max_in_flight == 0 {
			return Err(invalid("requests.max_in_flight"));
		}
		Ok(())
	}
}

fn invalid(field: &'static str) -> ConfigError {
	ConfigError::Invalid {
		field,
		reason: "must be greater than zero",
	}
}
