//! Browser fingerprint spoofing.
//!
//! A [`Fingerprint`] is derived purely from an RNG, then mapped to the headers
//! and cookies a session presents. Seeding the RNG makes both reproducible.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng, seq::SliceRandom};
use http::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrowserFamily {
    Chrome,
    Edge,
    Firefox,
    Safari,
}

impl BrowserFamily {
    const WEIGHTED: [(BrowserFamily, u32); 4] = [
        (BrowserFamily::Chrome, 60),
        (BrowserFamily::Edge, 15),
        (BrowserFamily::Firefox, 15),
        (BrowserFamily::Safari, 10),
    ];

    /// Chromium browsers send client hints; the others do not.
    pub fn is_chromium(self) -> bool {
        matches!(self, BrowserFamily::Chrome | BrowserFamily::Edge)
    }

    fn brand(self) -> &'static str {
        match self {
            BrowserFamily::Chrome => "Google Chrome",
            BrowserFamily::Edge => "Microsoft Edge",
            BrowserFamily::Firefox => "Firefox",
            BrowserFamily::Safari => "Safari",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PlatformTemplate {
    ua_token: &'static str,
    gecko_token: &'static str,
    navigator: &'static str,
    hint: &'static str,
}

const WINDOWS: PlatformTemplate = PlatformTemplate {
    ua_token: "Windows NT 10.0; Win64; x64",
    gecko_token: "Windows NT 10.0; Win64; x64",
    navigator: "Win32",
    hint: "Windows",
};

const MACOS: PlatformTemplate = PlatformTemplate {
    ua_token: "Macintosh; Intel Mac OS X 10_15_7",
    gecko_token: "Macintosh; Intel Mac OS X 10.15",
    navigator: "MacIntel",
    hint: "macOS",
};

const LINUX: PlatformTemplate = PlatformTemplate {
    ua_token: "X11; Linux x86_64",
    gecko_token: "X11; Linux x86_64",
    navigator: "Linux x86_64",
    hint: "Linux",
};

const VIEWPORTS: [(u16, u16); 6] = [
    (1920, 1080),
    (1536, 864),
    (1366, 768),
    (1440, 900),
    (2560, 1440),
    (1280, 720),
];

const DEVICE_MEMORY: [u8; 3] = [4, 8, 16];

const REFERERS: [&str; 4] = [
    "https://www.google.com/",
    "https://trends.google.com/trends/",
    "https://trends.google.com/trends/explore",
    "https://www.google.com/search?q=google+trends",
];

fn accept_languages(region: &str) -> &'static [(&'static str, u32)] {
    match region {
        "IN" => &[
            ("en-IN,en;q=0.9,hi;q=0.8", 50),
            ("en-US,en;q=0.9", 35),
            ("hi-IN,hi;q=0.9,en;q=0.8", 15),
        ],
        "US" => &[("en-US,en;q=0.9", 85), ("en-US,en;q=0.9,es;q=0.8", 15)],
        "GB" => &[("en-GB,en;q=0.9", 80), ("en-US,en;q=0.9", 20)],
        _ => &[("en-US,en;q=0.9", 70), ("en-GB,en;q=0.9", 30)],
    }
}

/// Minutes west of UTC, the convention the upstream `tz` parameter uses.
fn timezone_offsets(region: &str) -> &'static [i32] {
    match region {
        "IN" => &[-330],
        "US" => &[300, 360, 420, 480],
        "GB" => &[0, -60],
        "DE" | "FR" => &[-60, -120],
        "JP" => &[-540],
        "AU" => &[-600, -540, -480],
        "BR" => &[180],
        _ => &[0],
    }
}

/// Synthesised browser identity. Regenerated for every session.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub family: BrowserFamily,
    pub major_version: u16,
    pub user_agent: String,
    pub accept_language: String,
    pub referer: String,
    pub viewport: (u16, u16),
    pub platform: String,
    pub platform_hint: String,
    pub device_memory: u8,
    /// `sec-ch-ua` brand list; present only for Chromium families.
    pub sec_ch_ua: Option<String>,
    pub timezone_offset: i32,
    pub cookie_seed: u64,
    pub issued_at: DateTime<Utc>,
}

impl Fingerprint {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R, region: &str, now: DateTime<Utc>) -> Self {
        let region = region.to_ascii_uppercase();
        let family = BrowserFamily::WEIGHTED
            .choose_weighted(rng, |(_, weight)| *weight)
            .map(|(family, _)| *family)
            .unwrap_or(BrowserFamily::Chrome);

        let platform = match family {
            BrowserFamily::Safari => MACOS,
            _ => *[WINDOWS, WINDOWS, MACOS, LINUX]
                .choose(rng)
                .unwrap_or(&WINDOWS),
        };

        let major_version = match family {
            BrowserFamily::Chrome | BrowserFamily::Edge => rng.gen_range(118..=124),
            BrowserFamily::Firefox => rng.gen_range(119..=125),
            BrowserFamily::Safari => rng.gen_range(16..=17),
        };

        let user_agent = match family {
            BrowserFamily::Chrome => format!(
                "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{major_version}.0.0.0 Safari/537.36",
                platform.ua_token
            ),
            BrowserFamily::Edge => format!(
                "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{major_version}.0.0.0 Safari/537.36 Edg/{major_version}.0.0.0",
                platform.ua_token
            ),
            BrowserFamily::Firefox => format!(
                "Mozilla/5.0 ({}; rv:{major_version}.0) Gecko/20100101 Firefox/{major_version}.0",
                platform.gecko_token
            ),
            BrowserFamily::Safari => format!(
                "Mozilla/5.0 ({}) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/{major_version}.{} Safari/605.1.15",
                platform.ua_token,
                rng.gen_range(0..=4)
            ),
        };

        let sec_ch_ua = family.is_chromium().then(|| {
            format!(
                "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"{major_version}\", \"{}\";v=\"{major_version}\"",
                family.brand()
            )
        });

        let accept_language = accept_languages(&region)
            .choose_weighted(rng, |(_, weight)| *weight)
            .map(|(language, _)| language.to_string())
            .unwrap_or_else(|_| "en-US,en;q=0.9".to_string());

        Self {
            family,
            major_version,
            user_agent,
            accept_language,
            referer: REFERERS.choose(rng).unwrap_or(&REFERERS[0]).to_string(),
            viewport: *VIEWPORTS.choose(rng).unwrap_or(&VIEWPORTS[0]),
            platform: platform.navigator.to_string(),
            platform_hint: platform.hint.to_string(),
            device_memory: *DEVICE_MEMORY.choose(rng).unwrap_or(&8),
            sec_ch_ua,
            timezone_offset: *timezone_offsets(&region).choose(rng).unwrap_or(&0),
            cookie_seed: rng.r#gen(),
            issued_at: now,
        }
    }

    pub fn random(region: &str) -> Self {
        Self::generate(&mut rand::thread_rng(), region, Utc::now())
    }

    pub fn headers(&self) -> HeaderBundle {
        HeaderBundle::from_fingerprint(self)
    }

    pub fn cookies(&self, domain: &str) -> CookieBundle {
        CookieBundle::from_fingerprint(self, domain)
    }
}

#[derive(Debug, Error)]
pub enum SpoofingError {
    #[error("invalid header {name}: {message}")]
    InvalidHeader { name: String, message: String },
}

/// Ordered request headers derived from a fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderBundle {
    pub entries: Vec<(String, String)>,
}

impl HeaderBundle {
    pub fn from_fingerprint(fp: &Fingerprint) -> Self {
        let mut entries = vec![
            ("User-Agent".to_string(), fp.user_agent.clone()),
            (
                "Accept".to_string(),
                "text/html,application/xhtml+xml,application/xml;q=0.9,application/json;q=0.8,*/*;q=0.7"
                    .to_string(),
            ),
            ("Accept-Language".to_string(), fp.accept_language.clone()),
            ("Accept-Encoding".to_string(), "gzip, deflate, br".to_string()),
            ("Referer".to_string(), fp.referer.clone()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Keep-Alive".to_string(), "timeout=300".to_string()),
            ("DNT".to_string(), "1".to_string()),
            ("Upgrade-Insecure-Requests".to_string(), "1".to_string()),
            ("Sec-Fetch-Dest".to_string(), "document".to_string()),
            ("Sec-Fetch-Mode".to_string(), "navigate".to_string()),
            ("Sec-Fetch-Site".to_string(), "same-origin".to_string()),
        ];

        if let Some(brands) = &fp.sec_ch_ua {
            entries.push(("sec-ch-ua".to_string(), brands.clone()));
            entries.push(("sec-ch-ua-mobile".to_string(), "?0".to_string()));
            entries.push((
                "sec-ch-ua-platform".to_string(),
                format!("\"{}\"", fp.platform_hint),
            ));
            entries.push(("Viewport-Width".to_string(), fp.viewport.0.to_string()));
            entries.push(("Device-Memory".to_string(), fp.device_memory.to_string()));
        }

        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn to_header_map(&self) -> Result<HeaderMap, SpoofingError> {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            let header = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                SpoofingError::InvalidHeader {
                    name: name.clone(),
                    message: err.to_string(),
                }
            })?;
            let value = HeaderValue::from_str(value).map_err(|err| SpoofingError::InvalidHeader {
                name: name.clone(),
                message: err.to_string(),
            })?;
            map.insert(header, value);
        }
        Ok(map)
    }
}

/// Google consent and preference cookies bound to one domain.
#[derive(Debug, Clone, PartialEq)]
pub struct CookieBundle {
    pub domain: String,
    pub cookies: Vec<(String, String)>,
}

impl CookieBundle {
    pub const NAMES: [&'static str; 4] = ["NID", "1P_JAR", "CONSENT", "ANID"];

    pub fn from_fingerprint(fp: &Fingerprint, domain: &str) -> Self {
        let mut rng = StdRng::seed_from_u64(fp.cookie_seed);
        let nid = format!("511={}", random_token(&mut rng, 120));
        let jar = fp.issued_at.format("%Y-%m-%d-%H").to_string();
        let consent = format!(
            "YES+cb.{}-{:02}-p0.en+FX+{}",
            fp.issued_at.format("%Y%m%d"),
            rng.gen_range(4..=18),
            rng.gen_range(100..=999)
        );
        let anid = format!("AHWqTU{}", random_token(&mut rng, 40));

        Self {
            domain: domain.to_string(),
            cookies: vec![
                ("NID".to_string(), nid),
                ("1P_JAR".to_string(), jar),
                ("CONSENT".to_string(), consent),
                ("ANID".to_string(), anid),
            ],
        }
    }

    /// `Set-Cookie` style strings for a cookie jar.
    pub fn set_cookie_strings(&self) -> Vec<String> {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}; Domain={}; Path=/", self.domain))
            .collect()
    }
}

/// Cookie domain for an upstream host: Google hosts share `.google.com`.
pub fn cookie_domain(host: &str) -> String {
    if host == "google.com" || host.ends_with(".google.com") {
        ".google.com".to_string()
    } else {
        host.to_string()
    }
}

fn random_token<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len).map(|_| char::from(rng.sample(Alphanumeric))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 14, 0, 0).unwrap()
    }

    #[test]
    fn seeded_fingerprints_are_reproducible() {
        let a = Fingerprint::generate(&mut StdRng::seed_from_u64(11), "IN", now());
        let b = Fingerprint::generate(&mut StdRng::seed_from_u64(11), "IN", now());
        assert_eq!(a, b);
        assert_eq!(a.headers(), b.headers());
        assert_eq!(a.cookies(".google.com"), b.cookies(".google.com"));
    }

    #[test]
    fn client_hints_match_family() {
        for seed in 0..64 {
            let fp = Fingerprint::generate(&mut StdRng::seed_from_u64(seed), "US", now());
            let headers = fp.headers();
            if fp.family.is_chromium() {
                let brands = headers.get("sec-ch-ua").unwrap();
                assert!(brands.contains(fp.family.brand()));
                assert!(brands.contains(&format!("v=\"{}\"", fp.major_version)));
                assert!(fp.user_agent.contains(&format!("Chrome/{}", fp.major_version)));
            } else {
                assert!(headers.get("sec-ch-ua").is_none());
            }
            if fp.family == BrowserFamily::Safari {
                assert_eq!(fp.platform, "MacIntel");
            }
        }
    }

    #[test]
    fn india_uses_ist_offset() {
        let fp = Fingerprint::generate(&mut StdRng::seed_from_u64(5), "in", now());
        assert_eq!(fp.timezone_offset, -330);
    }

    #[test]
    fn cookies_are_well_formed() {
        let fp = Fingerprint::generate(&mut StdRng::seed_from_u64(8), "IN", now());
        let bundle = fp.cookies(&cookie_domain("trends.google.com"));
        assert_eq!(bundle.domain, ".google.com");
        let names: Vec<&str> = bundle.cookies.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, CookieBundle::NAMES);
        assert_eq!(bundle.cookies[1].1, "2024-03-05-14");
        assert!(bundle.cookies[0].1.starts_with("511="));
        assert!(
            bundle
                .set_cookie_strings()
                .iter()
                .all(|cookie| cookie.contains("Domain=.google.com"))
        );
    }

    #[test]
    fn header_bundle_converts_to_map() {
        let fp = Fingerprint::generate(&mut StdRng::seed_from_u64(2), "GB", now());
        let map = fp.headers().to_header_map().unwrap();
        assert_eq!(
            map.get("user-agent").unwrap().to_str().unwrap(),
            fp.user_agent
        );
        assert_eq!(map.get("connection").unwrap(), "keep-alive");
    }
}
