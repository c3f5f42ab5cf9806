//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into core
//! services, rather than read from ambient state during request handling. The
//! settings here correspond to the study-level request options an
//! administrator controls.

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    requests_enabled: bool,
    shopping_cart_enabled: bool,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// `requests_enabled` gates the specimen request feature as a whole;
    /// `shopping_cart_enabled` controls whether new requests start in the
    /// editable shopping-cart status and must be explicitly submitted.
    pub fn new(requests_enabled: bool, shopping_cart_enabled: bool) -> Self {
        Self {
            requests_enabled,
            shopping_cart_enabled,
        }
    }

    pub fn requests_enabled(&self) -> bool {
        self.requests_enabled
    }

    pub fn shopping_cart_enabled(&self) -> bool {
        self.shopping_cart_enabled
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::new(true, true)
    }
}
