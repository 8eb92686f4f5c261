//! The transform pipeline applied to every framed payload.
//!
//! A plugin is a pure pair of transforms. The core only specifies the
//! interface and the forward/reverse ordering; concrete plugins
//! (compression, encryption, checksumming, ...) are the application's
//! concern.

/// A single transform stage in the pipeline.
///
/// `on_transmit` is applied outbound, `on_receive` inbound. For a plugin
/// to compose symmetrically with its peers, `on_receive` should undo
/// `on_transmit` (`on_receive(on_transmit(x)) == x`), though this is not
/// enforced by the trait.
pub trait Plugin: Send + Sync {
    /// Transforms a payload before it is framed and sent.
    fn on_transmit(&self, payload: Vec<u8>) -> Vec<u8>;

    /// Transforms a payload after it has been read off the wire.
    fn on_receive(&self, payload: Vec<u8>) -> Vec<u8>;
}

/// How a plugin is supplied when registering it with a
/// [`Connection`](crate::connection::Connection), [`Server`](crate::server::Server)
/// or [`Client`](crate::client::Client): either a ready-made instance, or a
/// constructor invoked once to build one. Duplicates are allowed in both
/// cases.
pub enum PluginProvider {
    Instance(Box<dyn Plugin>),
    Factory(Box<dyn Fn() -> Box<dyn Plugin> + Send + Sync>),
}

impl PluginProvider {
    /// Resolves a factory to an instance, invoking it if needed. Called
    /// once per connection construction.
    pub(crate) fn resolve(self) -> Box<dyn Plugin> {
        match self {
            PluginProvider::Instance(plugin) => plugin,
            PluginProvider::Factory(build) => build(),
        }
    }
}

impl<P> From<P> for PluginProvider
where
    P: Plugin + 'static,
{
    fn from(plugin: P) -> Self {
        PluginProvider::Instance(Box::new(plugin))
    }
}

/// An ordered, resolved plugin chain.
///
/// Outbound traversal is front-to-back (`plugins[0]` first); inbound
/// traversal is the exact reverse. This asymmetry is what lets a
/// compress-then-encrypt outbound pipeline compose with a
/// decrypt-then-decompress inbound one.
pub(crate) struct PluginChain {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginChain {
    pub(crate) fn new(providers: Vec<PluginProvider>) -> Self {
        Self { plugins: providers.into_iter().map(PluginProvider::resolve).collect() }
    }

    pub(crate) fn on_transmit(&self, mut payload: Vec<u8>) -> Vec<u8> {
        for plugin in &self.plugins {
            payload = plugin.on_transmit(payload);
        }
        payload
    }

    pub(crate) fn on_receive(&self, mut payload: Vec<u8>) -> Vec<u8> {
        for plugin in self.plugins.iter().rev() {
            payload = plugin.on_receive(payload);
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tag(u8);
    impl Plugin for Tag {
        fn on_transmit(&self, mut payload: Vec<u8>) -> Vec<u8> {
            payload.push(self.0);
            payload
        }

        fn on_receive(&self, mut payload: Vec<u8>) -> Vec<u8> {
            assert_eq!(payload.pop(), Some(self.0));
            payload
        }
    }

    #[test]
    fn transmit_is_front_to_back_receive_is_reverse() {
        let chain = PluginChain::new(vec![Tag(1).into(), Tag(2).into(), Tag(3).into()]);
        let out = chain.on_transmit(vec![0x42]);
        assert_eq!(out, vec![0x42, 1, 2, 3]);

        let back = chain.on_receive(out);
        assert_eq!(back, vec![0x42]);
    }

    #[test]
    fn factory_is_invoked_once_per_resolve() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CALLS: AtomicU32 = AtomicU32::new(0);

        struct Counted;
        impl Plugin for Counted {
            fn on_transmit(&self, payload: Vec<u8>) -> Vec<u8> {
                payload
            }

            fn on_receive(&self, payload: Vec<u8>) -> Vec<u8> {
                payload
            }
        }

        let provider = PluginProvider::Factory(Box::new(|| {
            CALLS.fetch_add(1, Ordering::Relaxed);
            Box::new(Counted)
        }));
        let _chain = PluginChain::new(vec![provider]);
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
    }
}
