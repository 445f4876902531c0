use std::sync::Arc;

use crate::Matcher;

/// 应用状态
pub struct AppState {
    /// 识别流水线编排器
    pub matcher: Matcher,
}

impl AppState {
    pub fn new(matcher: Matcher) -> Arc<Self> {
        Arc::new(AppState { matcher })
    }
}
