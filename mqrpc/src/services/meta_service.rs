use std::sync::OnceLock;

use crate::Result;

#[mqrpc_macro::service]
pub trait MetaService {
    /// Protocol version the server implements. Clients ask for it right after
    /// connecting and gate newer methods on it.
    async fn protocol_version(&self) -> Result<u32>;

    async fn list_methods(&self) -> Result<Vec<String>>;
}

pub(crate) struct MetaServiceImpl {
    protocol_version: u32,
    methods: OnceLock<Vec<String>>,
}

impl MetaServiceImpl {
    pub(crate) fn new(protocol_version: u32) -> Self {
        Self {
            protocol_version,
            methods: OnceLock::new(),
        }
    }

    pub(crate) fn set_methods(&self, mut methods: Vec<String>) {
        methods.sort();
        let _ = self.methods.set(methods);
    }
}

impl MetaService for MetaServiceImpl {
    async fn protocol_version(&self) -> Result<u32> {
        Ok(self.protocol_version)
    }

    async fn list_methods(&self) -> Result<Vec<String>> {
        Ok(self.methods.get().cloned().unwrap_or_default())
    }
}
