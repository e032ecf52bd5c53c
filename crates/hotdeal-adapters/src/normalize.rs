use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use hotdeal_core::{Category, HotDealDraft, IdentityMode, SiteId};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::RawRecord;

pub const DEFAULT_SELLER: &str = "기타";

/// Query keys boards use for the post number, most specific first.
const POST_ID_QUERY_KEYS: [&str; 4] = ["no", "wr_id", "post_id", "id"];

const CATEGORY_KEYWORDS: &[(Category, &[&str])] = &[
    (
        Category::Fashion,
        &["의류", "옷", "신발", "가방", "악세서리", "패션", "블랙야크", "나이키", "아디다스"],
    ),
    (
        Category::Food,
        &["식품", "음식", "건강", "비타민", "영양제", "홍삼", "건강식품", "커피", "라면"],
    ),
    (
        Category::Electronics,
        &[
            "가전", "전자", "디지털", "컴퓨터", "노트북", "스마트폰", "갤럭시", "아이폰", "모니터",
            "ssd", "이어폰",
        ],
    ),
    (
        Category::Living,
        &["생활", "가구", "인테리어", "주방", "욕실", "청소", "수납", "세제"],
    ),
    (
        Category::Books,
        &["도서", "책", "문구", "필기구", "노트", "다이어리"],
    ),
    (
        Category::Beauty,
        &["화장품", "미용", "스킨케어", "메이크업", "향수", "헤어"],
    ),
    (Category::Sports, &["운동", "스포츠", "헬스", "자전거", "캠핑", "골프"]),
    (Category::Travel, &["여행", "항공", "호텔", "숙박", "렌터카"]),
    (
        Category::Game,
        &["게임", "스팀", "steam", "닌텐도", "플스", "ps5", "xbox"],
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PriceInfo {
    pub price: u64,
    pub original_price: Option<u64>,
    pub discount_rate: Option<u8>,
}

fn integer_runs(text: &str) -> Vec<u64> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        // thousands separators stay inside a run
        if ch == ',' && !current.is_empty() {
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<u64>() {
                out.push(v);
            }
            current.clear();
        }
    }
    if let Ok(v) = current.parse::<u64>() {
        out.push(v);
    }
    out
}

fn discount(price: u64, original: u64) -> Option<u8> {
    if original == 0 || price >= original {
        return None;
    }
    let saved = u128::from(original - price) * 100;
    let original = u128::from(original);
    let rate = (saved + original / 2) / original;
    u8::try_from(rate.min(100)).ok()
}

/// Parses listing price text such as `"13,900원"`, `"(27,600/무료)"` or
/// `"(50,000원/30,000원)"`. With two amounts the smaller one is the sale
/// price. Text without digits (e.g. `"무료"`) is a price of zero.
pub fn parse_price(text: &str) -> PriceInfo {
    let runs = integer_runs(text);
    match runs.as_slice() {
        [] => PriceInfo::default(),
        [only] => PriceInfo {
            price: *only,
            ..PriceInfo::default()
        },
        [a, b, ..] => {
            let (price, original) = if a <= b { (*a, *b) } else { (*b, *a) };
            if price == original {
                return PriceInfo {
                    price,
                    ..PriceInfo::default()
                };
            }
            PriceInfo {
                price,
                original_price: Some(original),
                discount_rate: discount(price, original),
            }
        }
    }
}

fn is_free_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("무료") || lower.contains("free") || lower.contains("0원")
}

/// The trailing `(...)` of a title, where boards like ppomppu put the price.
fn title_price_tail(title: &str) -> Option<&str> {
    let trimmed = title.trim_end();
    if !trimmed.ends_with(')') {
        return None;
    }
    let open = trimmed.rfind('(')?;
    Some(&trimmed[open..])
}

/// Seller from a leading `[쿠팡]`-style bracket.
pub fn extract_seller(title: &str) -> Option<String> {
    let rest = title.trim_start().strip_prefix('[')?;
    let close = rest.find(']')?;
    let seller = rest[..close].trim();
    (!seller.is_empty()).then(|| seller.to_string())
}

pub fn infer_category(title: &str, seller: &str) -> Category {
    let haystacks = [title.to_lowercase(), seller.to_lowercase()];
    for hay in &haystacks {
        for (category, keywords) in CATEGORY_KEYWORDS {
            if keywords.iter().any(|k| hay.contains(k)) {
                return *category;
            }
        }
    }
    Category::Other
}

/// Post number embedded in a listing link: the last all-digit path segment,
/// else one of the usual post-number query parameters.
pub fn extract_post_id_from_link(link: &str) -> Option<String> {
    let without_fragment = link.split('#').next().unwrap_or_default();
    let (path, query) = match without_fragment.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (without_fragment, None),
    };

    let path = path
        .split_once("://")
        .map(|(_, rest)| rest.split_once('/').map(|(_, p)| p).unwrap_or_default())
        .unwrap_or(path);
    if let Some(segment) = path
        .split('/')
        .rev()
        .find(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
    {
        return Some(segment.to_string());
    }

    let params: Vec<(&str, &str)> = query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .collect();
    POST_ID_QUERY_KEYS.iter().find_map(|key| {
        params
            .iter()
            .find(|(k, v)| k == key && !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
            .map(|(_, v)| v.to_string())
    })
}

/// Degraded identity for records that carry no post number at all.
pub fn fallback_post_id(title: &str, link: &str, timestamp: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().as_bytes());
    hasher.update(b"\n");
    hasher.update(link.trim().as_bytes());
    hasher.update(b"\n");
    hasher.update(timestamp.to_rfc3339().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("fb-{}", &digest[..16])
}

fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap_or_else(|| Utc.fix())
}

/// Board date column: `"11:23:45"` (today), `"24/11/16"`, `"12-25"` (this
/// year) or `"2024-11-16 11:23"`, read in Korean time.
pub fn parse_post_date(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let text = text.trim();
    let tz = kst();
    let today = now.with_timezone(&tz).date_naive();

    let naive = if let Ok(time) = NaiveTime::parse_from_str(text, "%H:%M:%S") {
        today.and_time(time)
    } else if let Ok(time) = NaiveTime::parse_from_str(text, "%H:%M") {
        today.and_time(time)
    } else if let Ok(date) = NaiveDate::parse_from_str(text, "%y/%m/%d") {
        date.and_time(NaiveTime::MIN)
    } else if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M") {
        dt
    } else if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        date.and_time(NaiveTime::MIN)
    } else if let Ok(date) = NaiveDate::parse_from_str(text, "%Y.%m.%d") {
        date.and_time(NaiveTime::MIN)
    } else {
        let (month, day) = text.split_once('-')?;
        let date = NaiveDate::from_ymd_opt(today.year(), month.parse().ok()?, day.parse().ok()?)?;
        date.and_time(NaiveTime::MIN)
    };
    tz.from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Converts one raw record into a draft. Never fails: malformed fields fall
/// back to defaults and are logged as data-quality warnings.
pub fn normalize(site: SiteId, record: &RawRecord, crawled_at: DateTime<Utc>) -> HotDealDraft {
    let title = collapse_whitespace(record.title());
    let link = record.url().trim().to_string();
    if title.is_empty() {
        warn!(%site, link = %link, "raw record has no title");
    }

    let (source_post_id, identity_mode) = if let Some(id) = record.post_number() {
        (id.to_string(), IdentityMode::SourceId)
    } else if let Some(id) = extract_post_id_from_link(&link) {
        (id, IdentityMode::SourceId)
    } else {
        let date_text = match record {
            RawRecord::Board(p) => p.date_text.as_deref(),
            RawRecord::Market(p) => p.date_text.as_deref(),
        };
        let stamp = date_text
            .and_then(|t| parse_post_date(t, crawled_at))
            .unwrap_or(crawled_at);
        let id = fallback_post_id(&title, &link, stamp);
        warn!(%site, post_id = %id, title = %title, "no source post id; using fallback hash identity");
        (id, IdentityMode::FallbackHash)
    };

    let bracket_seller = extract_seller(&title);
    let (price, seller, image_url, counts, end_date) = match record {
        RawRecord::Board(p) => {
            let price_text = clean_opt(p.price_text.as_deref())
                .or_else(|| title_price_tail(&title).map(ToString::to_string));
            let price = match price_text.as_deref() {
                Some(text) => {
                    let info = parse_price(text);
                    if info.price == 0 && !is_free_text(text) {
                        warn!(%site, post_id = %source_post_id, price_text = %text, "unparsable price; storing 0");
                    }
                    info
                }
                None => PriceInfo::default(),
            };
            (
                price,
                bracket_seller,
                clean_opt(p.thumbnail_url.as_deref()),
                (p.views, p.likes, p.comments),
                p.ends_at,
            )
        }
        RawRecord::Market(p) => {
            let price = match p.price {
                Some(price) => {
                    let original_price = p.original_price.filter(|o| *o > price);
                    PriceInfo {
                        price,
                        original_price,
                        discount_rate: original_price.and_then(|o| discount(price, o)),
                    }
                }
                None => title_price_tail(&title).map(parse_price).unwrap_or_default(),
            };
            (
                price,
                clean_opt(p.store.as_deref()).or(bracket_seller),
                clean_opt(p.thumbnail_url.as_deref()),
                (p.views, p.recommends, p.comments),
                p.ends_at,
            )
        }
    };

    let seller = seller.unwrap_or_else(|| DEFAULT_SELLER.to_string());
    let category = infer_category(&title, &seller);

    HotDealDraft {
        source: site,
        source_post_id,
        identity_mode,
        title,
        description: None,
        price: price.price,
        original_price: price.original_price,
        discount_rate: price.discount_rate,
        category,
        image_url,
        original_url: link,
        seller,
        crawled_at,
        ended: record.is_ended(),
        end_date,
        view_count: counts.0,
        like_count: counts.1,
        comment_count: counts.2,
    }
}
