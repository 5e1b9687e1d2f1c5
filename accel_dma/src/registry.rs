//! Address registry.
//!
//! Maps bound endpoint addresses to the contexts that own them. Each context
//! holds at most one address; rebinding requires an unbind first.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::EndpointAddress;

/// The address a context is currently bound to.
#[derive(Debug, Default)]
pub struct Binding {
    addr: Mutex<Option<EndpointAddress>>,
}

impl Binding {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bound address, if any.
    pub fn get(&self) -> Option<EndpointAddress> {
        *self.addr.lock()
    }

    /// The bound address, or [`Error::NotBound`].
    pub fn require(&self) -> Result<EndpointAddress> {
        self.get().ok_or(Error::NotBound)
    }

    /// Run `f` with the bound address, holding the binding so an unbind
    /// cannot interleave.
    pub fn with_bound<R>(&self, f: impl FnOnce(EndpointAddress) -> Result<R>) -> Result<R> {
        let bound = self.addr.lock();
        let addr = (*bound).ok_or(Error::NotBound)?;
        f(addr)
    }
}

/// Routing table from addresses to bound contexts.
pub struct PortTable<T> {
    ports: RwLock<HashMap<EndpointAddress, Arc<T>>>,
}

impl<T> Default for PortTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PortTable<T> {
    pub fn new() -> Self {
        Self {
            ports: RwLock::new(HashMap::new()),
        }
    }

    /// Bind `addr` to `ctx`, recording it in `binding`.
    ///
    /// # Errors
    /// - [`Error::AlreadyBound`] if `binding` already holds an address.
    /// - [`Error::AddressInUse`] if another context holds `addr`.
    pub fn bind(&self, binding: &Binding, addr: EndpointAddress, ctx: Arc<T>) -> Result<()> {
        let mut bound = binding.addr.lock();
        if let Some(current) = *bound {
            return Err(Error::AlreadyBound(current));
        }

        let mut ports = self.ports.write();
        if ports.contains_key(&addr) {
            return Err(Error::AddressInUse(addr));
        }
        ports.insert(addr, ctx);
        *bound = Some(addr);

        debug!(%addr, "bound address");
        Ok(())
    }

    /// Release the address held by `binding`.
    ///
    /// # Errors
    /// Returns [`Error::NotBound`] if `binding` holds no address.
    pub fn unbind(&self, binding: &Binding) -> Result<EndpointAddress> {
        let mut bound = binding.addr.lock();
        let addr = bound.take().ok_or(Error::NotBound)?;
        self.ports.write().remove(&addr);

        debug!(%addr, "unbound address");
        Ok(addr)
    }

    /// The context bound to `addr`.
    pub fn resolve(&self, addr: EndpointAddress) -> Option<Arc<T>> {
        self.ports.read().get(&addr).cloned()
    }

    /// Number of bound addresses.
    pub fn len(&self) -> usize {
        self.ports.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
