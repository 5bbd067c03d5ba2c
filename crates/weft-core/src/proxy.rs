//! Memoizing stub factory over a fixed method-name set.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::caller::{CallHandle, RpcCaller};
use crate::registry::CallArg;

/// A client-side view of one remote service.
///
/// Built over an [`RpcCaller`] and the service's known method names. Stubs
/// are created on first lookup and memoized: asking for the same name twice
/// yields the same [`MethodStub`] allocation. Names outside the set yield
/// `None`; nothing is sent for them.
pub struct ServiceProxy {
    caller: RpcCaller,
    methods: &'static [&'static str],
    stubs: Mutex<HashMap<&'static str, Arc<MethodStub>>>,
}

impl ServiceProxy {
    pub fn new(caller: RpcCaller, methods: &'static [&'static str]) -> Self {
        ServiceProxy {
            caller,
            methods,
            stubs: Mutex::new(HashMap::new()),
        }
    }

    /// The method names this proxy exposes.
    pub fn methods(&self) -> &'static [&'static str] {
        self.methods
    }

    /// Look a stub up, creating and caching it on first use.
    pub fn method(&self, name: &str) -> Option<Arc<MethodStub>> {
        let name = self.methods.iter().copied().find(|m| *m == name)?;
        let mut stubs = self.stubs.lock();
        let stub = stubs.entry(name).or_insert_with(|| {
            Arc::new(MethodStub {
                caller: self.caller.clone(),
                name,
            })
        });
        Some(Arc::clone(stub))
    }
}

/// An invokable remote method.
pub struct MethodStub {
    caller: RpcCaller,
    name: &'static str,
}

impl MethodStub {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn call(&self, args: Vec<CallArg>) -> CallHandle {
        self.caller.call(self.name, args)
    }
}
