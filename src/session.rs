use std::sync::Arc;

use crate::store::ShopStore;

/// Who is asking, and the store their request reads and writes.
///
/// Built once per request and handed to the dispatch loop and every tool
/// call. Nothing request-scoped lives anywhere else.
#[derive(Clone)]
pub struct RequestContext {
    pub user_id: String,
    pub store: Arc<dyn ShopStore>,
}

impl RequestContext {
    pub fn new(user_id: impl Into<String>, store: Arc<dyn ShopStore>) -> Self {
        Self {
            user_id: user_id.into(),
            store,
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}
