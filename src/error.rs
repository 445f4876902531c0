use thiserror::Error;

/// 识别流水线的错误类型
///
/// 校验类错误直接上抛且不重试；编码器错误由 matcher 重试一次后上抛；
/// 边框检测失败不属于错误（静默回退到整图）。
#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("不支持的图片格式: {0}")]
    UnsupportedFormat(String),

    #[error("图片超过大小限制: {size} 字节（上限 {limit} 字节）")]
    Oversize { size: usize, limit: usize },

    #[error("无法解码图片: {0}")]
    Undecodable(String),

    #[error("嵌入向量维度错误: {got}（应为 {want}）")]
    InvalidDimension { got: usize, want: usize },

    #[error("退化嵌入向量（零范数），拒绝入库")]
    DegenerateEmbedding,

    #[error("飞盘不存在: {0}")]
    UnknownDisc(i64),

    #[error("图片记录不存在: {0}")]
    UnknownImage(i64),

    #[error("非法的状态转换: {0}")]
    InvalidTransition(String),

    #[error("操作超时")]
    Timeout,

    #[error("编码器推理失败: {0}")]
    Encode(String),

    #[error("存储层错误: {0}")]
    Store(#[from] sqlx::Error),

    #[error("文件系统错误: {0}")]
    Io(#[from] std::io::Error),
}

impl MatcherError {
    /// 是否属于调用方参数错误（而非服务端故障）
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFormat(_)
                | Self::Oversize { .. }
                | Self::Undecodable(_)
                | Self::InvalidDimension { .. }
                | Self::DegenerateEmbedding
                | Self::UnknownDisc(_)
                | Self::UnknownImage(_)
                | Self::InvalidTransition(_)
        )
    }
}
