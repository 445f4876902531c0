use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::border::Border;

/// 飞盘的登记状态，三个取值之间可自由转换
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscStatus {
    Registered,
    Stolen,
    Found,
}

impl DiscStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Stolen => "stolen",
            Self::Found => "found",
        }
    }
}

impl fmt::Display for DiscStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(Self::Registered),
            "stolen" => Ok(Self::Stolen),
            "found" => Ok(Self::Found),
            other => Err(format!("未知的飞盘状态: {other}")),
        }
    }
}

impl TryFrom<String> for DiscStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// 上传流程状态：pending 只能前进到 success 一次，success 为终态
///
/// 只有 success 的飞盘对搜索可见。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Success,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            other => Err(format!("未知的上传状态: {other}")),
        }
    }
}

impl TryFrom<String> for UploadStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// 飞盘记录
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Disc {
    pub id: i64,
    pub owner_name: String,
    pub owner_contact: String,
    #[sqlx(try_from = "String")]
    pub status: DiscStatus,
    #[sqlx(try_from = "String")]
    pub upload_status: UploadStatus,
    pub disc_model: Option<String>,
    pub disc_color: Option<String>,
    pub notes: Option<String>,
    pub location: Option<String>,
    pub registered_date: Option<DateTime<Utc>>,
    pub stolen_date: Option<DateTime<Utc>>,
    pub found_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 新建飞盘时的元数据
#[derive(Debug, Clone)]
pub struct NewDisc {
    pub owner_name: String,
    pub owner_contact: String,
    pub status: DiscStatus,
    pub disc_model: Option<String>,
    pub disc_color: Option<String>,
    pub notes: Option<String>,
    pub location: Option<String>,
}

impl Default for NewDisc {
    fn default() -> Self {
        Self {
            owner_name: "Pending".to_string(),
            owner_contact: "pending@example.com".to_string(),
            status: DiscStatus::Registered,
            disc_model: None,
            disc_color: None,
            notes: None,
            location: None,
        }
    }
}

/// 飞盘图片记录（不含向量本体）
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DiscImage {
    pub id: i64,
    pub disc_id: i64,
    /// 产生向量的编码器名称
    pub model_name: String,
    pub image_path: String,
    pub cropped_image_path: Option<String>,
    pub border: Option<Json<Border>>,
    pub created_at: DateTime<Utc>,
}

/// 向量检索的单条命中
#[derive(Debug, Clone, FromRow)]
pub struct SearchHit {
    pub image_id: i64,
    pub disc_id: i64,
    pub similarity: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for s in [DiscStatus::Registered, DiscStatus::Stolen, DiscStatus::Found] {
            assert_eq!(s.to_string().parse::<DiscStatus>().unwrap(), s);
        }
        assert!("lost".parse::<DiscStatus>().is_err());
    }

    #[test]
    fn upload_status_round_trip() {
        for s in [UploadStatus::Pending, UploadStatus::Success] {
            assert_eq!(s.to_string().parse::<UploadStatus>().unwrap(), s);
        }
        assert!("PENDING".parse::<UploadStatus>().is_err());
    }
}
