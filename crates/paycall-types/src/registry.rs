//! Registry trait for self-registering implementations.
//!
//! Pluggable backends (storage, verifiers) expose a `Registry` type that names
//! the implementation as it appears in configuration and hands out a factory.

/// Base trait for implementation registries.
pub trait ImplementationRegistry {
	/// The name used in configuration files to reference this implementation,
	/// e.g. "memory" for `[storage.implementations.memory]`.
	const NAME: &'static str;

	/// The factory function type this implementation provides.
	type Factory;

	/// Returns the factory function for this implementation.
	fn factory() -> Self::Factory;
}
