//! Granule discovery.
//!
//! [`CmrCatalog`] queries NASA's Common Metadata Repository for the DISP granules
//! of one frame; [`MemoryCatalog`] serves records held in memory.

use crate::config::CatalogContext;
use crate::types::{DispError, DispResult, FrameId, GranuleRecord, OrbitDirection};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

/// Source of granule records
pub trait GranuleCatalog: Sync {
    /// Every known granule of `frame_id`, in no particular order
    fn granules_for_frame(&self, frame_id: FrameId) -> DispResult<Vec<GranuleRecord>>;
}

#[derive(Debug, Deserialize)]
struct UmmResponse {
    #[serde(default)]
    items: Vec<UmmItem>,
}

#[derive(Debug, Deserialize)]
struct UmmItem {
    meta: UmmMeta,
    umm: UmmBody,
}

#[derive(Debug, Deserialize)]
struct UmmMeta {
    #[serde(rename = "native-id")]
    native_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UmmBody {
    #[serde(default)]
    additional_attributes: Vec<UmmAttribute>,
    #[serde(default)]
    related_urls: Vec<UmmUrl>,
    temporal_extent: Option<UmmTemporalExtent>,
    data_granule: Option<UmmDataGranule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UmmAttribute {
    name: String,
    #[serde(default)]
    values: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UmmUrl {
    #[serde(rename = "URL")]
    url: String,
    #[serde(rename = "Type")]
    url_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UmmTemporalExtent {
    range_date_time: Option<UmmRangeDateTime>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UmmRangeDateTime {
    beginning_date_time: Option<String>,
    ending_date_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UmmDataGranule {
    production_date_time: Option<String>,
}

impl UmmBody {
    fn attribute(&self, names: &[&str]) -> Option<&str> {
        self.additional_attributes
            .iter()
            .find(|a| names.contains(&a.name.as_str()))
            .and_then(|a| a.values.first())
            .map(|v| v.as_str())
    }

    fn url(&self, url_type: &str) -> Option<&str> {
        let candidates: Vec<&UmmUrl> = self.related_urls.iter().filter(|u| u.url_type == url_type).collect();
        candidates
            .iter()
            .find(|u| u.url.ends_with(".nc"))
            .or_else(|| candidates.first())
            .map(|u| u.url.as_str())
    }
}

/// Dates and frame encoded in an OPERA DISP scene name
#[derive(Debug, Clone, PartialEq)]
pub struct SceneNameFields {
    pub frame_id: FrameId,
    pub reference_date: DateTime<Utc>,
    pub secondary_date: DateTime<Utc>,
    pub creation_date: DateTime<Utc>,
}

fn parse_compact_timestamp(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, "%Y%m%dT%H%M%SZ")
        .ok()
        .map(|t| Utc.from_utc_datetime(&t))
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
        .or_else(|| parse_compact_timestamp(text))
}

/// Parse `OPERA_L3_DISP-S1_IW_F11115_VV_<ref>_<sec>_v1.0_<creation>`
pub fn parse_scene_name(name: &str) -> Option<SceneNameFields> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| {
            Regex::new(r"_F(\d+)_[A-Z]{2}_(\d{8}T\d{6}Z)_(\d{8}T\d{6}Z)_v[\d.]+_(\d{8}T\d{6}Z)").ok()
        })
        .as_ref()?;
    let caps = pattern.captures(name)?;
    Some(SceneNameFields {
        frame_id: caps[1].parse().ok()?,
        reference_date: parse_compact_timestamp(&caps[2])?,
        secondary_date: parse_compact_timestamp(&caps[3])?,
        creation_date: parse_compact_timestamp(&caps[4])?,
    })
}

fn record_from_umm(item: &UmmItem) -> DispResult<GranuleRecord> {
    let scene_name = item.meta.native_id.clone();
    let umm = &item.umm;
    let from_name = parse_scene_name(&scene_name);

    let frame_id = match umm.attribute(&["FRAME_NUMBER", "FRAME_ID"]) {
        Some(v) => v
            .parse()
            .map_err(|_| DispError::Catalog(format!("Invalid frame number {} in {}", v, scene_name)))?,
        None => from_name
            .as_ref()
            .map(|f| f.frame_id)
            .ok_or_else(|| DispError::Catalog(format!("No frame number for {}", scene_name)))?,
    };

    let orbit_direction = umm
        .attribute(&["ASCENDING_DESCENDING"])
        .and_then(|v| v.parse::<OrbitDirection>().ok());
    let relative_orbit = umm
        .attribute(&["PATH_NUMBER"])
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let range = umm.temporal_extent.as_ref().and_then(|t| t.range_date_time.as_ref());
    let reference_date = range
        .and_then(|r| r.beginning_date_time.as_deref())
        .and_then(parse_timestamp)
        .or_else(|| from_name.as_ref().map(|f| f.reference_date));
    let secondary_date = range
        .and_then(|r| r.ending_date_time.as_deref())
        .and_then(parse_timestamp)
        .or_else(|| from_name.as_ref().map(|f| f.secondary_date));
    let creation_date = umm
        .data_granule
        .as_ref()
        .and_then(|d| d.production_date_time.as_deref())
        .and_then(parse_timestamp)
        .or_else(|| from_name.as_ref().map(|f| f.creation_date));

    let missing = |field: &str| DispError::Catalog(format!("No {} for {}", field, scene_name));
    let url = umm.url("GET DATA").ok_or_else(|| missing("download URL"))?.to_string();

    Ok(GranuleRecord {
        frame_id,
        orbit_direction,
        relative_orbit,
        reference_date: reference_date.ok_or_else(|| missing("reference date"))?,
        secondary_date: secondary_date.ok_or_else(|| missing("secondary date"))?,
        creation_date: creation_date.ok_or_else(|| missing("creation date"))?,
        url,
        s3_uri: umm.url("GET DATA VIA DIRECT ACCESS").map(|s| s.to_string()),
        scene_name,
    })
}

/// Parse a `granules.umm_json` response body
pub fn parse_umm_response(body: &str) -> DispResult<Vec<GranuleRecord>> {
    let response: UmmResponse = serde_json::from_str(body)?;
    let mut records = Vec::with_capacity(response.items.len());
    for item in &response.items {
        match record_from_umm(item) {
            Ok(record) => records.push(record),
            Err(e) => log::warn!("Skipping catalog entry: {}", e),
        }
    }
    Ok(records)
}

/// CMR search client
pub struct CmrCatalog {
    context: CatalogContext,
    client: reqwest::blocking::Client,
}

impl CmrCatalog {
    pub fn new(context: CatalogContext) -> DispResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(context.timeout_secs))
            .user_agent(concat!("dispmosaic/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DispError::Catalog(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { context, client })
    }

    /// One page of results plus the search-after token for the next page
    fn query_page(&self, frame_id: FrameId, search_after: Option<&str>) -> DispResult<(String, Option<String>)> {
        let params = [
            ("short_name", self.context.short_name.clone()),
            ("provider", self.context.provider.clone()),
            ("attribute[]", format!("int,FRAME_NUMBER,{}", frame_id)),
            ("page_size", self.context.page_size.to_string()),
        ];
        let mut request = self.client.get(&self.context.endpoint).query(&params);
        if let Some(token) = &self.context.token {
            request = request.bearer_auth(token);
        }
        if let Some(after) = search_after {
            request = request.header("CMR-Search-After", after);
        }

        let response = request
            .send()
            .map_err(|e| DispError::Catalog(format!("CMR request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(DispError::Catalog(format!(
                "CMR returned HTTP {} for frame {}",
                response.status().as_u16(),
                frame_id
            )));
        }

        let next = response
            .headers()
            .get("CMR-Search-After")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response
            .text()
            .map_err(|e| DispError::Catalog(format!("Failed to read CMR response: {}", e)))?;
        Ok((body, next))
    }
}

impl GranuleCatalog for CmrCatalog {
    fn granules_for_frame(&self, frame_id: FrameId) -> DispResult<Vec<GranuleRecord>> {
        log::info!("Searching {} for frame {}", self.context.short_name, frame_id);

        let mut records = Vec::new();
        let mut search_after: Option<String> = None;
        loop {
            let (body, next) = self.query_page(frame_id, search_after.as_deref())?;
            let page = parse_umm_response(&body)?;
            let page_len = page.len();
            records.extend(page.into_iter().filter(|r| r.frame_id == frame_id));

            match next {
                Some(token) if page_len > 0 && Some(&token) != search_after.as_ref() => search_after = Some(token),
                _ => break,
            }
        }

        log::info!("Found {} granules for frame {}", records.len(), frame_id);
        Ok(records)
    }
}

/// Catalog over records held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    records: Vec<GranuleRecord>,
}

impl MemoryCatalog {
    pub fn new(records: Vec<GranuleRecord>) -> Self {
        Self { records }
    }
}

impl GranuleCatalog for MemoryCatalog {
    fn granules_for_frame(&self, frame_id: FrameId) -> DispResult<Vec<GranuleRecord>> {
        Ok(self.records.iter().filter(|r| r.frame_id == frame_id).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENE: &str = "OPERA_L3_DISP-S1_IW_F11115_VV_20160705T140755Z_20160729T140756Z_v1.0_20250318T222753Z";

    #[test]
    fn test_parse_scene_name() {
        let fields = parse_scene_name(SCENE).unwrap();
        assert_eq!(fields.frame_id, 11115);
        assert_eq!(fields.reference_date, Utc.with_ymd_and_hms(2016, 7, 5, 14, 7, 55).unwrap());
        assert_eq!(fields.secondary_date, Utc.with_ymd_and_hms(2016, 7, 29, 14, 7, 56).unwrap());
        assert_eq!(fields.creation_date, Utc.with_ymd_and_hms(2025, 3, 18, 22, 27, 53).unwrap());
        assert!(parse_scene_name("not_a_granule").is_none());
    }

    #[test]
    fn test_parse_umm_record() {
        let body = format!(
            r#"{{"items": [{{
                "meta": {{"native-id": "{SCENE}"}},
                "umm": {{
                    "AdditionalAttributes": [
                        {{"Name": "FRAME_NUMBER", "Values": ["11115"]}},
                        {{"Name": "ASCENDING_DESCENDING", "Values": ["DESCENDING"]}},
                        {{"Name": "PATH_NUMBER", "Values": ["71"]}}
                    ],
                    "TemporalExtent": {{"RangeDateTime": {{
                        "BeginningDateTime": "2016-07-05T14:07:55Z",
                        "EndingDateTime": "2016-07-29T14:07:56Z"
                    }}}},
                    "DataGranule": {{"ProductionDateTime": "2025-03-18T22:27:53Z"}},
                    "RelatedUrls": [
                        {{"URL": "https://example.com/{SCENE}.png", "Type": "GET DATA"}},
                        {{"URL": "https://example.com/{SCENE}.nc", "Type": "GET DATA"}},
                        {{"URL": "s3://bucket/{SCENE}.nc", "Type": "GET DATA VIA DIRECT ACCESS"}}
                    ]
                }}
            }}]}}"#
        );
        let records = parse_umm_response(&body).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.frame_id, 11115);
        assert_eq!(record.orbit_direction, Some(OrbitDirection::Descending));
        assert_eq!(record.relative_orbit, 71);
        assert!(record.url.ends_with(".nc"));
        assert_eq!(record.s3_uri.as_deref(), Some(format!("s3://bucket/{SCENE}.nc").as_str()));
        assert_eq!(record.secondary_date, Utc.with_ymd_and_hms(2016, 7, 29, 14, 7, 56).unwrap());
    }

    #[test]
    fn test_umm_falls_back_to_scene_name() {
        let body = format!(
            r#"{{"items": [{{
                "meta": {{"native-id": "{SCENE}"}},
                "umm": {{"RelatedUrls": [{{"URL": "https://example.com/g.nc", "Type": "GET DATA"}}]}}
            }}, {{
                "meta": {{"native-id": "garbage"}},
                "umm": {{}}
            }}]}}"#
        );
        let records = parse_umm_response(&body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].frame_id, 11115);
        assert_eq!(records[0].orbit_direction, None);
        assert_eq!(records[0].reference_date, Utc.with_ymd_and_hms(2016, 7, 5, 14, 7, 55).unwrap());
    }
}
