//! Analysis payload validation and prompt rendering.

use serde_json::{Map, Value};
use thiserror::Error;

/// Role instruction sent as the system message.
pub const SYSTEM_ROLE: &str = "Bạn là một chuyên gia phân tích đầu tư cao cấp.";

const PROMPT_TEMPLATE: &str = "\
Bạn là một chuyên gia phân tích đầu tư cao cấp tại một quỹ đầu tư lớn.
Nhiệm vụ của bạn là xem xét các kết quả định lượng và viết một báo cáo tổng hợp súc tích, chuyên nghiệp.

DỮ LIỆU CÔNG TY:
{company_data}

YÊU CẦU:
1. Tổng hợp và viết lại thành một bản nhận định chuyên nghiệp
2. Đưa ra mức định giá hợp lý và nhận định
3. Đề xuất chiến lược đầu tư trong 6 tháng tới

Văn phong chuyên nghiệp, tự tin và tập trung vào kết quả.
";

/// Fields that, when present, must be strings.
const TEXT_FIELDS: &[&str] = &["name", "company_name", "industry_sector", "headquarters"];

/// Fields that, when present, must be numbers.
const NUMERIC_FIELDS: &[&str] = &[
    "revenue",
    "profit",
    "assets",
    "founding_year",
    "number_of_employees",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Invalid JSON input: {0}")]
    InvalidJson(String),

    #[error("company data payload must be a JSON object")]
    NotAnObject,

    #[error("company data payload is empty")]
    Empty,

    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
}

/// A validated company document.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisPayload {
    fields: Map<String, Value>,
}

impl AnalysisPayload {
    /// Validate a payload. A JSON-encoded string is decoded first.
    pub fn from_value(value: Value) -> Result<Self, PayloadError> {
        let value = match value {
            Value::String(encoded) => serde_json::from_str::<Value>(&encoded)
                .map_err(|e| PayloadError::InvalidJson(e.to_string()))?,
            other => other,
        };

        let fields = match value {
            Value::Object(map) => map,
            _ => return Err(PayloadError::NotAnObject),
        };
        if fields.is_empty() {
            return Err(PayloadError::Empty);
        }

        for &field in TEXT_FIELDS {
            if matches!(fields.get(field), Some(v) if !v.is_string()) {
                return Err(PayloadError::WrongType {
                    field,
                    expected: "a string",
                });
            }
        }
        for &field in NUMERIC_FIELDS {
            if matches!(fields.get(field), Some(v) if !v.is_number()) {
                return Err(PayloadError::WrongType {
                    field,
                    expected: "a number",
                });
            }
        }

        Ok(Self { fields })
    }

    /// Company name, if the document carries one.
    pub fn company_name(&self) -> Option<&str> {
        self.fields
            .get("name")
            .or_else(|| self.fields.get("company_name"))
            .and_then(Value::as_str)
    }

    /// Render the user prompt with the document pretty-printed.
    pub fn render_prompt(&self) -> String {
        let data = serde_json::to_string_pretty(&self.fields).unwrap_or_default();
        PROMPT_TEMPLATE.replace("{company_data}", &data)
    }
}
