//! current_time 工具：返回当前时间（RFC 3339），可指定 UTC 偏移

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use schemars::JsonSchema;
use serde::Deserialize;

use crate::tools::TypedTool;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CurrentTimeArgs {
    /// UTC 偏移小时数（-12..=14），缺省为 UTC
    #[serde(default)]
    pub utc_offset_hours: Option<i32>,
}

pub struct CurrentTimeTool;

#[async_trait]
impl TypedTool for CurrentTimeTool {
    type Args = CurrentTimeArgs;

    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Current date and time in RFC 3339. Args: {\"utc_offset_hours\": 8} (optional)"
    }

    async fn call(&self, args: CurrentTimeArgs) -> Result<String, String> {
        let hours = args.utc_offset_hours.unwrap_or(0);
        if !(-12..=14).contains(&hours) {
            return Err(format!("utc_offset_hours out of range: {hours}"));
        }
        let offset = FixedOffset::east_opt(hours * 3600)
            .ok_or_else(|| format!("invalid offset: {hours}"))?;
        Ok(Utc::now().with_timezone(&offset).to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Tool, Typed};
    use serde_json::json;

    #[tokio::test]
    async fn test_current_time_offset() {
        let tool = Typed(CurrentTimeTool);
        let out = tool.execute(json!({"utc_offset_hours": 8})).await.unwrap();
        assert!(out.ends_with("+08:00"));
        let utc = tool.execute(json!({})).await.unwrap();
        assert!(utc.ends_with("+00:00"));
        assert!(tool.execute(json!({"utc_offset_hours": 20})).await.is_err());
    }
}
