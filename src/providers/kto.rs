//! Tourism provider client: endpoint composition and paging.

use std::sync::Arc;

use serde_json::Value;

use super::{extract_page, Paginator, Provider};
use crate::error::BatchError;
use crate::gateway::executor::{CallSpec, HttpExecutor};
use crate::pipeline::transform::ContentType;

/// Area-based list endpoint for bulk harvests.
pub const AREA_BASED_LIST: &str = "areaBasedList2";
/// Common-detail endpoint used for overview enrichment.
pub const DETAIL_COMMON: &str = "detailCommon2";
/// Cheapest read on the service, used for key probes.
pub const AREA_CODE_LIST: &str = "areaCode2";

pub struct KtoApi {
    executor: Arc<HttpExecutor>,
    page_size: u32,
}

impl KtoApi {
    pub fn new(executor: Arc<HttpExecutor>, page_size: u32) -> Self {
        Self {
            executor,
            page_size,
        }
    }

    /// Page through every item of one content type in one area.
    pub fn area_based_list(&self, content_type: ContentType, area_code: &str) -> Paginator {
        Paginator::new(
            self.executor.clone(),
            Provider::Kto,
            AREA_BASED_LIST,
            vec![
                ("contentTypeId".to_string(), content_type.code().to_string()),
                ("areaCode".to_string(), area_code.to_string()),
                ("arrange".to_string(), "C".to_string()),
            ],
            self.page_size,
        )
    }

    /// Fetch the common-detail record (overview text) for one content id.
    pub async fn detail_common(&self, content_id: &str) -> Result<Option<Value>, BatchError> {
        let response = self
            .executor
            .call(CallSpec {
                provider: Provider::Kto,
                endpoint: DETAIL_COMMON,
                params: vec![
                    ("contentId".to_string(), content_id.to_string()),
                    ("defaultYN".to_string(), "Y".to_string()),
                    ("overviewYN".to_string(), "Y".to_string()),
                    ("numOfRows".to_string(), "1".to_string()),
                    ("pageNo".to_string(), "1".to_string()),
                ],
                store_raw: true,
            })
            .await?;

        let page = extract_page(&response.body)?;
        Ok(page.items.into_iter().next())
    }

    /// Minimal request used to probe disabled keys.
    pub fn probe_spec() -> (&'static str, Vec<(String, String)>) {
        (
            AREA_CODE_LIST,
            vec![
                ("numOfRows".to_string(), "1".to_string()),
                ("pageNo".to_string(), "1".to_string()),
            ],
        )
    }
}
