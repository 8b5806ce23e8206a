//! Rule-weighted advertising / promo detection.
//!
//! Stateless: every raw item is scored against a compiled rule set and
//! compared to a threshold that grows with the source's trust level.
//! Rule kinds: hashtag keyword lists, plain keyword lists, URL shape
//! patterns, structural heuristics. Whitelisted domains cancel URL rules
//! for the matching link.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

/// Verdict for one scored item.
#[derive(Debug, Clone, PartialEq)]
pub struct AdVerdict {
    pub is_ad: bool,
    pub score: f64,
    /// Fired rule ids as `kind:name`, in rule declaration order.
    pub reasons: Vec<String>,
}

impl AdVerdict {
    pub fn clean() -> Self {
        AdVerdict {
            is_ad: false,
            score: 0.0,
            reasons: Vec::new(),
        }
    }
}

/// Structural facts the adapter knows about the raw item.
#[derive(Debug, Clone, Default)]
pub struct ItemShape {
    pub urls: Vec<String>,
    pub hashtags: Vec<String>,
    /// Channel/user the item was forwarded from, when the transport exposes it.
    pub forwarded_from: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeywordRule {
    pub name: String,
    pub keywords: Vec<String>,
    pub weight: f64,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternRule {
    pub name: String,
    pub pattern: String,
    pub weight: f64,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuleFile {
    #[serde(default)]
    pub hashtag_rules: Vec<KeywordRule>,
    #[serde(default)]
    pub keyword_rules: Vec<KeywordRule>,
    #[serde(default)]
    pub url_rules: Vec<PatternRule>,
    #[serde(default)]
    pub structural: StructuralWeights,
    #[serde(default)]
    pub whitelisted_domains: Vec<String>,
    #[serde(default)]
    pub blacklisted_channels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StructuralWeights {
    pub many_urls: f64,
    pub forwarded_ad: f64,
    pub short_with_links: f64,
}

impl Default for StructuralWeights {
    fn default() -> Self {
        Self {
            many_urls: 2.0,
            forwarded_ad: 3.0,
            short_with_links: 1.5,
        }
    }
}

struct CompiledUrlRule {
    name: String,
    re: Regex,
    weight: f64,
}

/// Compiled scorer. Build once at startup, share by reference.
pub struct AntispamScorer {
    threshold_default: f64,
    threshold_trusted: f64,
    hashtag_rules: Vec<KeywordRule>,
    keyword_rules: Vec<KeywordRule>,
    url_rules: Vec<CompiledUrlRule>,
    structural: StructuralWeights,
    whitelisted_domains: Vec<String>,
    blacklisted_channels: Vec<String>,
}

static RE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s)>\]]+").unwrap());
static RE_HASHTAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?u)#[\w\p{Cyrillic}]+").unwrap());

impl AntispamScorer {
    pub fn new(threshold_default: f64, threshold_trusted: f64, rules: RuleFile) -> anyhow::Result<Self> {
        let mut url_rules = Vec::with_capacity(rules.url_rules.len());
        for r in rules.url_rules.into_iter().filter(|r| r.enabled) {
            let re = Regex::new(&r.pattern)
                .map_err(|e| anyhow::anyhow!("url rule `{}` regex error: {}", r.name, e))?;
            url_rules.push(CompiledUrlRule {
                name: r.name,
                re,
                weight: r.weight,
            });
        }
        Ok(Self {
            threshold_default,
            threshold_trusted,
            hashtag_rules: rules.hashtag_rules.into_iter().filter(|r| r.enabled).collect(),
            keyword_rules: rules.keyword_rules.into_iter().filter(|r| r.enabled).collect(),
            url_rules,
            structural: rules.structural,
            whitelisted_domains: rules.whitelisted_domains,
            blacklisted_channels: rules.blacklisted_channels,
        })
    }

    /// Load rules from YAML; fall back to the compiled-in defaults when the
    /// path is absent.
    pub fn from_config(
        threshold_default: f64,
        threshold_trusted: f64,
        rules_path: Option<&Path>,
    ) -> anyhow::Result<Self> {
        let rules = match rules_path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)?;
                serde_yaml::from_str::<RuleFile>(&content)
                    .map_err(|e| anyhow::anyhow!("parsing antispam rules {}: {}", p.display(), e))?
            }
            _ => default_rules(),
        };
        Self::new(threshold_default, threshold_trusted, rules)
    }

    pub fn threshold_for(&self, trust_level: u8) -> f64 {
        if trust_level >= 7 {
            self.threshold_trusted
        } else {
            self.threshold_default
        }
    }

    /// Score one item. `shape` carries transport-level facts; URLs and
    /// hashtags found in the text are merged in.
    pub fn score(&self, text: &str, shape: &ItemShape, trust_level: u8) -> AdVerdict {
        // Fully trusted channels skip scoring entirely.
        if trust_level >= 9 {
            return AdVerdict::clean();
        }

        let text_lower = text.to_lowercase();
        let mut score = 0.0;
        let mut reasons = Vec::new();

        let mut hashtags: Vec<String> = shape.hashtags.iter().map(|h| h.to_lowercase()).collect();
        for m in RE_HASHTAG.find_iter(&text_lower) {
            hashtags.push(m.as_str().to_string());
        }

        for rule in &self.hashtag_rules {
            let hit = hashtags
                .iter()
                .any(|h| rule.keywords.iter().any(|kw| h.contains(&kw.to_lowercase())));
            if hit {
                score += rule.weight;
                reasons.push(format!("hashtag:{}", rule.name));
            }
        }

        for rule in &self.keyword_rules {
            if rule.keywords.iter().any(|kw| text_lower.contains(&kw.to_lowercase())) {
                score += rule.weight;
                reasons.push(format!("keyword:{}", rule.name));
            }
        }

        let mut urls: Vec<String> = shape.urls.clone();
        for m in RE_URL.find_iter(text) {
            urls.push(m.as_str().to_string());
        }
        urls.sort();
        urls.dedup();

        for rule in &self.url_rules {
            let hit = urls
                .iter()
                .filter(|u| !self.is_whitelisted(u))
                .any(|u| rule.re.is_match(u));
            if hit {
                score += rule.weight;
                reasons.push(format!("url:{}", rule.name));
            }
        }

        if urls.len() > 3 {
            score += self.structural.many_urls;
            reasons.push("structural:many_urls".into());
        }
        if let Some(from) = &shape.forwarded_from {
            if self
                .blacklisted_channels
                .iter()
                .any(|c| c.eq_ignore_ascii_case(from))
            {
                score += self.structural.forwarded_ad;
                reasons.push("structural:forwarded_ad".into());
            }
        }
        if text.chars().count() < 50 && !urls.is_empty() {
            score += self.structural.short_with_links;
            reasons.push("structural:short_with_links".into());
        }

        let is_ad = score >= self.threshold_for(trust_level);
        AdVerdict {
            is_ad,
            score,
            reasons,
        }
    }

    fn is_whitelisted(&self, url: &str) -> bool {
        self.whitelisted_domains.iter().any(|d| url.contains(d.as_str()))
    }
}

/// Compiled-in defaults, mirroring the curated production rule set.
pub fn default_rules() -> RuleFile {
    RuleFile {
        hashtag_rules: vec![
            KeywordRule {
                name: "ad_hashtags".into(),
                keywords: vec![
                    "#реклама".into(),
                    "#ad".into(),
                    "#promo".into(),
                    "#промо".into(),
                    "#спонсор".into(),
                ],
                weight: 3.0,
                enabled: true,
            },
            KeywordRule {
                name: "partner_hashtags".into(),
                keywords: vec!["#партнер".into(), "#partner".into(), "#collab".into()],
                weight: 2.0,
                enabled: true,
            },
        ],
        keyword_rules: vec![
            KeywordRule {
                name: "casino".into(),
                keywords: vec![
                    "казино".into(),
                    "ставки".into(),
                    "букмекер".into(),
                    "бонус на депозит".into(),
                ],
                weight: 5.0,
                enabled: true,
            },
            KeywordRule {
                name: "discount".into(),
                keywords: vec![
                    "скидка".into(),
                    "промокод".into(),
                    "распродажа".into(),
                    "выгодное предложение".into(),
                ],
                weight: 2.0,
                enabled: true,
            },
            KeywordRule {
                name: "urgency".into(),
                keywords: vec![
                    "только сегодня".into(),
                    "осталось мест".into(),
                    "успей купить".into(),
                    "последний день".into(),
                ],
                weight: 1.5,
                enabled: true,
            },
            KeywordRule {
                name: "hard_sell".into(),
                keywords: vec!["купи акции!".into(), "пассивный доход".into(), "финансовая свобода".into()],
                weight: 3.0,
                enabled: true,
            },
        ],
        url_rules: vec![
            PatternRule {
                name: "tracker_params".into(),
                pattern: r"[?&](utm_|ref=|partner=)".into(),
                weight: 2.0,
                enabled: true,
            },
            PatternRule {
                name: "shorteners".into(),
                pattern: r"(bit\.ly|tinyurl|clck\.ru|vk\.cc)".into(),
                weight: 1.5,
                enabled: true,
            },
            PatternRule {
                name: "suspicious_tld".into(),
                pattern: r"\.(tk|ml|ga|cf)(/|$)".into(),
                weight: 2.0,
                enabled: true,
            },
        ],
        structural: StructuralWeights::default(),
        whitelisted_domains: vec![
            "gov.ru".into(),
            "cbr.ru".into(),
            "moex.com".into(),
            "e-disclosure.ru".into(),
            "interfax.ru".into(),
            "rbc.ru".into(),
            "vedomosti.ru".into(),
            "kommersant.ru".into(),
            "tass.ru".into(),
            "ria.ru".into(),
        ],
        blacklisted_channels: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> AntispamScorer {
        AntispamScorer::new(5.0, 8.0, default_rules()).unwrap()
    }

    #[test]
    fn promo_message_is_flagged_at_default_trust() {
        let s = scorer();
        let v = s.score("Купи акции! Скидка 50%! @promo", &ItemShape::default(), 5);
        assert!(v.is_ad, "expected ad, got {:?}", v);
        assert!(v.score >= 5.0);
        assert!(v.reasons.iter().any(|r| r.starts_with("keyword:")));
    }

    #[test]
    fn plain_market_news_passes() {
        let s = scorer();
        let v = s.score(
            "ЦБ повысил ключевую ставку до 16% годовых, следует из пресс-релиза регулятора.",
            &ItemShape::default(),
            5,
        );
        assert!(!v.is_ad);
        assert_eq!(v.score, 0.0);
        assert!(v.reasons.is_empty());
    }

    #[test]
    fn trusted_source_needs_higher_score() {
        let s = scorer();
        let text = "Скидка и промокод в приложении"; // discount rule only: 2.0
        assert!(!s.score(text, &ItemShape::default(), 8).is_ad);
        assert_eq!(s.threshold_for(8), 8.0);
        assert_eq!(s.threshold_for(5), 5.0);
    }

    #[test]
    fn trust_nine_bypasses_scoring() {
        let s = scorer();
        let v = s.score("Казино бонус на депозит! bit.ly/xx", &ItemShape::default(), 9);
        assert_eq!(v, AdVerdict::clean());
    }

    #[test]
    fn whitelisted_domain_cancels_url_rules() {
        let s = scorer();
        let spam = s.score(
            "Подробности тут https://bit.ly/promo?utm_source=tg",
            &ItemShape::default(),
            5,
        );
        assert!(spam.reasons.iter().any(|r| r.starts_with("url:")));

        let official = s.score(
            "Релиз: https://www.cbr.ru/press/pr/?id=123&utm_source=site",
            &ItemShape::default(),
            5,
        );
        assert!(
            !official.reasons.iter().any(|r| r.starts_with("url:")),
            "whitelisted domain must not fire URL rules: {:?}",
            official.reasons
        );
    }

    #[test]
    fn short_text_with_link_fires_structural_rule() {
        let s = scorer();
        let v = s.score("смотри https://t.me/x", &ItemShape::default(), 5);
        assert!(v.reasons.contains(&"structural:short_with_links".to_string()));
    }

    #[test]
    fn reasons_are_in_declaration_order() {
        let s = scorer();
        let v = s.score(
            "#реклама казино скидка, только сегодня! https://bit.ly/z https://a.tk/1 https://b.tk/2 https://c.tk/3",
            &ItemShape::default(),
            5,
        );
        let kinds: Vec<&str> = v.reasons.iter().map(|r| r.split(':').next().unwrap()).collect();
        let mut sorted_by_stage = kinds.clone();
        // hashtag rules fire before keyword rules, before url, before structural
        let order = |k: &&str| match *k {
            "hashtag" => 0,
            "keyword" => 1,
            "url" => 2,
            _ => 3,
        };
        sorted_by_stage.sort_by_key(order);
        assert_eq!(kinds, sorted_by_stage);
        assert!(v.is_ad);
    }

    #[test]
    fn forwarded_from_blacklisted_channel_scores() {
        let mut rules = default_rules();
        rules.blacklisted_channels = vec!["promo_hub".into()];
        let s = AntispamScorer::new(5.0, 8.0, rules).unwrap();
        let shape = ItemShape {
            forwarded_from: Some("promo_hub".into()),
            ..Default::default()
        };
        let v = s.score(
            "Интересное предложение для подписчиков нашего канала сегодня",
            &shape,
            5,
        );
        assert!(v.reasons.contains(&"structural:forwarded_ad".to_string()));
    }

    #[test]
    fn yaml_rule_file_parses() {
        let yml = r#"
keyword_rules:
  - name: test
    keywords: ["тест"]
    weight: 9.0
whitelisted_domains: ["example.ru"]
"#;
        let file: RuleFile = serde_yaml::from_str(yml).unwrap();
        let s = AntispamScorer::new(5.0, 8.0, file).unwrap();
        assert!(s.score("это тест", &ItemShape::default(), 5).is_ad);
    }
}
