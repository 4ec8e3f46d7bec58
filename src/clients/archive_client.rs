//! ALMA 归档服务客户端
//!
//! 封装 TAP 查询和 datalink 文件列表查询

use crate::error::ArchiveError;
use crate::models::{ArchiveRecord, SelectionSet, ASDM_TAR_SUFFIX};
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Cycle 编号与提案年份的偏移（Cycle 0 = 2011）
const CYCLE_YEAR_OFFSET: u32 = 2011;

/// 提案编号以四位年份开头
const MAX_PROPOSAL_YEAR: u32 = 9999;

/// ALMA 接收机波段 1..=10，区间只展开到这里
const MAX_BAND: u32 = 10;

/// 没有任何可用取值时的恒假条件
const MATCH_NOTHING: &str = "1 = 0";

/// 速度分辨率上限（m/s），低于此值为 FDM 数据
const MAX_VELOCITY_RESOLUTION: f64 = 50000.0;

/// 归档服务
#[async_trait]
pub trait ArchiveService: Send + Sync {
    /// 按目标源、波段集合和 cycle 集合查询可下载的 ASDM
    ///
    /// 空集合表示不按该维度过滤。
    async fn query(
        &self,
        target: &str,
        bands: &SelectionSet,
        cycles: &SelectionSet,
    ) -> Result<Vec<ArchiveRecord>, ArchiveError>;
}

/// 基于 HTTP 的 ALMA 归档客户端
pub struct AlmaArchiveClient {
    http: reqwest::Client,
    base_url: String,
    max_retries: usize,
    retry_delay: Duration,
}

impl AlmaArchiveClient {
    pub fn new(base_url: impl Into<String>, max_retries: usize, retry_delay: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_retries: max_retries.max(1),
            retry_delay,
        }
    }

    /// 生成 ADQL 查询
    ///
    /// 按选择集合中的每个区间生成条件，不逐值展开。
    pub fn build_query(target: &str, bands: &SelectionSet, cycles: &SelectionSet) -> String {
        let mut conditions = vec![format!("target_name = '{}'", escape_adql(target))];

        if !bands.is_empty() {
            conditions.push(any_of(band_terms(bands)));
        }
        if !cycles.is_empty() {
            conditions.push(any_of(cycle_terms(cycles)));
        }

        conditions.push("data_rights = 'Public'".to_string());

        format!(
            "SELECT member_ous_uid, antenna_arrays, velocity_resolution FROM ivoa.obscore WHERE {}",
            conditions.join(" AND ")
        )
    }

    /// 带固定间隔的重试，只重试暂时性错误
    async fn get_text(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<String, ArchiveError> {
        let mut last_error = None;

        for retry_count in 0..self.max_retries {
            match self.get_text_once(endpoint, query).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_transient() => {
                    warn!(
                        "归档服务暂时不可用 (尝试 {}/{}): {}",
                        retry_count + 1,
                        self.max_retries,
                        e
                    );
                    last_error = Some(e);
                    if retry_count + 1 < self.max_retries {
                        sleep(self.retry_delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ArchiveError::Transient {
            endpoint: endpoint.to_string(),
            message: "没有发出任何请求".to_string(),
        }))
    }

    async fn get_text_once(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<String, ArchiveError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| ArchiveError::from_reqwest(endpoint, e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ArchiveError::Transient {
                endpoint: endpoint.to_string(),
                message: format!("HTTP {status}"),
            });
        }
        if !status.is_success() {
            return Err(ArchiveError::Permanent {
                endpoint: endpoint.to_string(),
                message: format!("HTTP {status}"),
            });
        }

        response
            .text()
            .await
            .map_err(|e| ArchiveError::from_reqwest(endpoint, e))
    }

    /// 查询满足条件的成员 OUS 标识
    async fn member_ous_uids(
        &self,
        target: &str,
        bands: &SelectionSet,
        cycles: &SelectionSet,
    ) -> Result<Vec<String>, ArchiveError> {
        let adql = Self::build_query(target, bands, cycles);
        debug!("ADQL: {}", adql);

        let body = self
            .get_text(
                "/tap/sync",
                &[
                    ("REQUEST", "doQuery"),
                    ("LANG", "ADQL"),
                    ("FORMAT", "tsv"),
                    ("QUERY", adql.as_str()),
                ],
            )
            .await?;

        parse_obscore_tsv(&body).map_err(|message| ArchiveError::BadResponse {
            endpoint: "/tap/sync".to_string(),
            message,
        })
    }

    /// 单个成员 OUS 的 ASDM 文件列表；没有列表时返回 None
    async fn data_info(&self, member_ous_uid: &str) -> Result<Option<Vec<ArchiveRecord>>, ArchiveError> {
        let body = match self
            .get_text("/datalink/sync", &[("ID", member_ous_uid)])
            .await
        {
            Ok(body) => body,
            Err(ArchiveError::Permanent { message, .. }) => {
                debug!("{} 没有文件列表: {}", member_ous_uid, message);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let records = parse_datalink_votable(&body);
        Ok((!records.is_empty()).then_some(records))
    }
}

#[async_trait]
impl ArchiveService for AlmaArchiveClient {
    async fn query(
        &self,
        target: &str,
        bands: &SelectionSet,
        cycles: &SelectionSet,
    ) -> Result<Vec<ArchiveRecord>, ArchiveError> {
        let mut files = Vec::new();

        for mous in self.member_ous_uids(target, bands, cycles).await? {
            match self.data_info(&mous).await? {
                Some(records) => files.extend(
                    records
                        .into_iter()
                        .filter(|r| r.url.contains(ASDM_TAR_SUFFIX)),
                ),
                None => warn!("⚠️ {} 没有可用的文件列表，跳过", mous),
            }
        }

        Ok(files)
    }
}

/// `band_list` 是字符串列，只能逐值比较；区间截到 MAX_BAND
fn band_terms(bands: &SelectionSet) -> Vec<String> {
    let mut terms = Vec::new();
    for &(lo, hi) in bands.ranges() {
        if lo == hi {
            terms.push(format!("band_list = '{lo}'"));
            continue;
        }
        if hi > MAX_BAND {
            warn!("⚠️ 波段区间 {}~{} 超出 1~{}，只查询其中的有效波段", lo, hi, MAX_BAND);
        }
        terms.extend((lo..=hi.min(MAX_BAND)).map(|b| format!("band_list = '{b}'")));
    }
    terms
}

/// 单个 cycle 用前缀匹配，区间用提案编号的字典序范围
fn cycle_terms(cycles: &SelectionSet) -> Vec<String> {
    let year = |cycle: u32| {
        cycle
            .checked_add(CYCLE_YEAR_OFFSET)
            .filter(|y| *y <= MAX_PROPOSAL_YEAR)
    };

    let mut terms = Vec::new();
    for &(lo, hi) in cycles.ranges() {
        let Some(first) = year(lo) else {
            warn!("⚠️ Cycle {}~{} 对应的年份超出范围，已忽略", lo, hi);
            continue;
        };
        let last = year(hi).unwrap_or(MAX_PROPOSAL_YEAR);
        if first == last {
            terms.push(format!("proposal_id LIKE '{first}.%'"));
        } else {
            // '/' 紧跟在 '.' 之后，`< 'YYYY/'` 包含该年份的所有提案
            terms.push(format!(
                "(proposal_id >= '{first}.' AND proposal_id < '{last}/')"
            ));
        }
    }
    terms
}

fn any_of(terms: Vec<String>) -> String {
    if terms.is_empty() {
        return MATCH_NOTHING.to_string();
    }
    format!("({})", terms.join(" OR "))
}

fn escape_adql(value: &str) -> String {
    value.replace('\'', "''")
}

/// 解析 TAP 的 TSV 结果，只保留 12m 阵列（DV/DA）和 FDM 数据，按 OUS 去重
pub fn parse_obscore_tsv(body: &str) -> Result<Vec<String>, String> {
    let mut lines = body.lines().filter(|l| !l.trim().is_empty());
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| "缺少表头".to_string())?
        .split('\t')
        .map(str::trim)
        .collect();

    let column = |name: &str| {
        header
            .iter()
            .position(|h| *h == name)
            .ok_or_else(|| format!("缺少列 {name}"))
    };
    let uid_col = column("member_ous_uid")?;
    let arrays_col = column("antenna_arrays")?;
    let velres_col = column("velocity_resolution")?;

    let mut uids = BTreeSet::new();
    for line in lines {
        let cells: Vec<&str> = line.split('\t').collect();
        let cell = |i: usize| cells.get(i).map(|c| c.trim()).unwrap_or("");

        let arrays = cell(arrays_col);
        if !(arrays.contains("DV") || arrays.contains("DA")) {
            continue;
        }
        let fdm = cell(velres_col)
            .parse::<f64>()
            .map(|v| v < MAX_VELOCITY_RESOLUTION)
            .unwrap_or(false);
        if !fdm {
            continue;
        }
        let uid = cell(uid_col);
        if !uid.is_empty() {
            uids.insert(uid.to_string());
        }
    }

    Ok(uids.into_iter().collect())
}

/// 从 datalink 的 VOTable 中取出 `access_url` 和 `content_length`
pub fn parse_datalink_votable(body: &str) -> Vec<ArchiveRecord> {
    let (Ok(field_re), Ok(row_re), Ok(cell_re)) = (
        Regex::new(r#"<FIELD[^>]*\bname="([^"]+)""#),
        Regex::new(r"(?s)<TR>(.*?)</TR>"),
        Regex::new(r"(?s)<TD>(.*?)</TD>|<TD\s*/>"),
    ) else {
        return Vec::new();
    };

    let fields: Vec<&str> = field_re
        .captures_iter(body)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    let Some(url_col) = fields.iter().position(|f| *f == "access_url") else {
        return Vec::new();
    };
    let size_col = fields.iter().position(|f| *f == "content_length");

    row_re
        .captures_iter(body)
        .filter_map(|row| {
            let cells: Vec<String> = cell_re
                .captures_iter(row.get(1)?.as_str())
                .map(|c| {
                    c.get(1)
                        .map(|m| unescape_xml(m.as_str().trim()))
                        .unwrap_or_default()
                })
                .collect();
            let url = cells.get(url_col)?.clone();
            if url.is_empty() {
                return None;
            }
            let size_bytes = size_col
                .and_then(|i| cells.get(i))
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            Some(ArchiveRecord { url, size_bytes })
        })
        .collect()
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RangeSelector;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// 本地 HTTP 服务：按 (路径, 第几个请求) 返回状态码和内容，并计数
    async fn serve(respond: fn(&str, usize) -> (u16, String)) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 64 * 1024];
                let mut read = 0;
                while read < buf.len() {
                    let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    read += n;
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                let request = String::from_utf8_lossy(&buf[..read]);
                let path = request
                    .split_whitespace()
                    .nth(1)
                    .and_then(|target| target.split('?').next())
                    .unwrap_or("/")
                    .to_string();
                let (status, body) = respond(&path, counter.fetch_add(1, Ordering::SeqCst));

                let response = format!(
                    "HTTP/1.1 {status} Test\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{addr}"), hits)
    }

    fn client(base_url: String) -> AlmaArchiveClient {
        AlmaArchiveClient::new(base_url, 3, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let (url, hits) = serve(|_, n| {
            if n < 2 {
                (503, "busy".to_string())
            } else {
                (200, "payload".to_string())
            }
        })
        .await;

        let body = client(url).get_text("/tap/sync", &[]).await.unwrap();

        assert_eq!(body, "payload");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (url, hits) = serve(|_, _| (503, "busy".to_string())).await;

        let err = client(url).get_text("/tap/sync", &[]).await.unwrap_err();

        assert!(matches!(err, ArchiveError::Transient { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let (url, hits) = serve(|_, _| (404, "missing".to_string())).await;

        let err = client(url).get_text("/tap/sync", &[]).await.unwrap_err();

        assert!(matches!(err, ArchiveError::Permanent { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_member_without_listing_is_skipped() {
        let (url, _) = serve(|path, _| match path {
            "/tap/sync" => (
                200,
                "member_ous_uid\tantenna_arrays\tvelocity_resolution\n\
                 uid://A001/X1/X2\tA001:DV01\t1200\n"
                    .to_string(),
            ),
            _ => (404, "no such member".to_string()),
        })
        .await;

        let records = client(url)
            .query("J1832-1035", &RangeSelector::parse("7"), &SelectionSet::default())
            .await
            .unwrap();

        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_query_keeps_only_asdm_tarballs() {
        let (url, _) = serve(|path, _| match path {
            "/tap/sync" => (
                200,
                "member_ous_uid\tantenna_arrays\tvelocity_resolution\n\
                 uid://A001/X1/X2\tA001:DA41\t1200\n"
                    .to_string(),
            ),
            _ => (
                200,
                r#"<VOTABLE><FIELD name="access_url"/><FIELD name="content_length"/>
<TR><TD>https://host/2017.1.00001.S_uid___A002_X1_X2.asdm.sdm.tar</TD><TD>10</TD></TR>
<TR><TD>https://host/2017.1.00001.S_uid___A002_X1_X2_auxiliary.tar</TD><TD>5</TD></TR>
</VOTABLE>"#
                    .to_string(),
            ),
        })
        .await;

        let records = client(url)
            .query("J1832-1035", &SelectionSet::default(), &SelectionSet::default())
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert!(records[0].url.ends_with("uid___A002_X1_X2.asdm.sdm.tar"));
        assert_eq!(records[0].size_bytes, 10);
    }

    #[test]
    fn test_build_query_with_sets() {
        let adql = AlmaArchiveClient::build_query(
            "J1832-1035",
            &RangeSelector::parse("7"),
            &RangeSelector::parse("4,6~7"),
        );
        assert!(adql.contains("target_name = 'J1832-1035'"));
        assert!(adql.contains("(band_list = '7')"));
        assert!(adql.contains(
            "(proposal_id LIKE '2015.%' OR (proposal_id >= '2017.' AND proposal_id < '2018/'))"
        ));
        assert!(adql.ends_with("data_rights = 'Public'"));
    }

    #[test]
    fn test_build_query_huge_cycle_does_not_overflow() {
        let adql = AlmaArchiveClient::build_query(
            "X",
            &SelectionSet::default(),
            &RangeSelector::parse("4294967295"),
        );
        assert!(adql.contains("AND 1 = 0 AND"));
        assert!(!adql.contains("proposal_id"));

        let adql = AlmaArchiveClient::build_query(
            "X",
            &SelectionSet::default(),
            &RangeSelector::parse("12~4294967295"),
        );
        assert!(adql.contains("(proposal_id >= '2023.' AND proposal_id < '9999/')"));
    }

    #[test]
    fn test_build_query_wide_band_range_is_capped() {
        let adql = AlmaArchiveClient::build_query(
            "X",
            &RangeSelector::parse("<4000000000"),
            &SelectionSet::default(),
        );
        assert_eq!(adql.matches("band_list").count(), 11);
        assert!(adql.contains("band_list = '10')"));

        let adql = AlmaArchiveClient::build_query(
            "X",
            &RangeSelector::parse("99"),
            &SelectionSet::default(),
        );
        assert!(adql.contains("(band_list = '99')"));

        let adql = AlmaArchiveClient::build_query(
            "X",
            &RangeSelector::parse("20~4000000000"),
            &SelectionSet::default(),
        );
        assert!(adql.contains("AND 1 = 0 AND"));
    }

    #[test]
    fn test_build_query_without_cycles() {
        let adql = AlmaArchiveClient::build_query(
            "O'Brien",
            &SelectionSet::default(),
            &SelectionSet::default(),
        );
        assert!(adql.contains("'O''Brien'"));
        assert!(!adql.contains("proposal_id"));
        assert!(!adql.contains("band_list"));
    }

    #[test]
    fn test_parse_obscore_filters_rows() {
        let body = "member_ous_uid\tantenna_arrays\tvelocity_resolution\n\
                    uid://A001/X1/X2\tA001:DV01 A002:DA41\t1200.5\n\
                    uid://A001/X1/X2\tA001:DV01\t1300\n\
                    uid://A001/X1/X3\tJ501:CM01\t1200\n\
                    uid://A001/X1/X4\tA001:DA44\t60000\n\
                    uid://A001/X1/X5\tA001:DA44\t\n";
        assert_eq!(parse_obscore_tsv(body).unwrap(), vec!["uid://A001/X1/X2"]);
    }

    #[test]
    fn test_parse_obscore_missing_column() {
        assert!(parse_obscore_tsv("member_ous_uid\n").is_err());
        assert!(parse_obscore_tsv("").is_err());
    }

    #[test]
    fn test_parse_datalink() {
        let body = r#"<VOTABLE><RESOURCE><TABLE>
<FIELD name="ID" datatype="char"/>
<FIELD name="access_url" datatype="char"/>
<FIELD name="content_length" datatype="long"/>
<DATA><TABLEDATA>
<TR><TD>a</TD><TD>https://almascience.nao.ac.jp/dataPortal/2017.1.00001.S_uid___A002_X1_X2.asdm.sdm.tar</TD><TD>1073741824</TD></TR>
<TR><TD>b</TD><TD>https://host/x.tar?a=1&amp;b=2</TD><TD/></TR>
<TR><TD>c</TD><TD></TD><TD>5</TD></TR>
</TABLEDATA></DATA></TABLE></RESOURCE></VOTABLE>"#;
        let records = parse_datalink_votable(body);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].size_bytes, 1073741824);
        assert!(records[0].url.ends_with(".asdm.sdm.tar"));
        assert_eq!(records[1].url, "https://host/x.tar?a=1&b=2");
        assert_eq!(records[1].size_bytes, 0);
    }
}
