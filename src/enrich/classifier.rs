// src/enrich/classifier.rs
//! Deterministic taxonomy tagging: sector, country, news type/subtype and up
//! to three secondary tags. Keyword- and lexicon-driven on purpose: the
//! output must be reproducible for idempotent re-enrichment.

use once_cell::sync::Lazy;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewsType {
    OneCompany,
    Market,
    Regulatory,
}

impl NewsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NewsType::OneCompany => "one_company",
            NewsType::Market => "market",
            NewsType::Regulatory => "regulatory",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewsSubtype {
    Earnings,
    Guidance,
    MnA,
    Default,
    Sanctions,
    Hack,
    Legal,
    Esg,
    SupplyChain,
    TechOutage,
    ManagementChange,
    Other,
}

impl NewsSubtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            NewsSubtype::Earnings => "earnings",
            NewsSubtype::Guidance => "guidance",
            NewsSubtype::MnA => "mna",
            NewsSubtype::Default => "default",
            NewsSubtype::Sanctions => "sanctions",
            NewsSubtype::Hack => "hack",
            NewsSubtype::Legal => "legal",
            NewsSubtype::Esg => "esg",
            NewsSubtype::SupplyChain => "supply_chain",
            NewsSubtype::TechOutage => "tech_outage",
            NewsSubtype::ManagementChange => "management_change",
            NewsSubtype::Other => "other",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub sector: Option<String>,
    pub sector_confidence: f64,
    pub country: String,
    pub news_type: NewsType,
    pub subtype: NewsSubtype,
    /// `(code, confidence)`, primary first, at most three.
    pub topics: Vec<(String, f64)>,
}

/// Exchange sector by ticker, ICB-like codes.
static SECTOR_BY_TICKER: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for t in ["GAZP", "ROSN", "LKOH", "NVTK", "SNGS", "TATN", "TRNFP"] {
        m.insert(t, "oil_gas");
    }
    for t in ["GMKN", "NLMK", "CHMF", "MAGN", "PLZL", "ALRS", "RUAL"] {
        m.insert(t, "metals");
    }
    for t in ["SBER", "VTBR", "CBOM", "BSPB", "TCSG", "SBERP"] {
        m.insert(t, "banks");
    }
    for t in ["MTSS", "MFON", "RTKM"] {
        m.insert(t, "telecom");
    }
    for t in ["MGNT", "FIVE", "LENT", "FIXP", "OZON", "MVID"] {
        m.insert(t, "retail");
    }
    for t in ["HYDR", "IRAO", "FEES", "UPRO", "TGKA", "OGKB"] {
        m.insert(t, "energy");
    }
    for t in ["AFLT", "NMTP", "FESH", "GLTR", "FLOT"] {
        m.insert(t, "transport");
    }
    for t in ["PIKK", "LSRG", "SMLT", "ETLN"] {
        m.insert(t, "realestate");
    }
    for t in ["YNDX", "VKCO", "POSI", "HHRU", "CIAN", "ASTR"] {
        m.insert(t, "it");
    }
    for t in ["PHOR", "NKNC", "AKRN", "KAZT"] {
        m.insert(t, "chemistry");
    }
    for t in ["AGRO", "RSGR"] {
        m.insert(t, "agriculture");
    }
    m
});

/// Keyword buckets used when no linked issuer pins the sector.
static SECTOR_KEYWORDS: &[(&str, &[&str])] = &[
    ("oil_gas", &["нефть", "газ", "нефтегаз", "баррел", "добыча нефти", "трубопровод"]),
    ("metals", &["металл", "сталь", "никель", "алюмин", "золото", "руда"]),
    ("banks", &["банк", "кредит", "вклад", "ипотек", "банковск"]),
    ("telecom", &["связь", "оператор", "телеком", "мобильн"]),
    ("retail", &["ритейл", "магазин", "торговая сеть", "продаж в магазинах"]),
    ("energy", &["электроэнерг", "генерац", "энергосбыт", "гэс", "тэц"]),
    ("transport", &["перевозк", "авиакомпан", "аэропорт", "порт", "логистик"]),
    ("realestate", &["застройщик", "недвижимост", "девелопер", "жилья"]),
    ("it", &["it компан", "софт", "разработчик", "технологическ", "интернет сервис"]),
    ("chemistry", &["удобрен", "химическ", "полимер"]),
    ("agriculture", &["урожай", "зерно", "сельскохозяйств", "агро"]),
];

static COUNTRY_PATTERNS: &[(&str, &[&str])] = &[
    ("RU", &["росси", "рф", "рубл", "москв", "цб рф", "банк россии"]),
    ("US", &["сша", "соединенных штатов", "вашингтон", "фрс", "доллар"]),
    ("CN", &["кита", "пекин", "юан"]),
    ("EU", &["евросоюз", "еврокомисс", "брюссел", "ес ввел"]),
    ("KZ", &["казахстан"]),
    ("TR", &["турци", "лир"]),
];

static SUBTYPE_KEYWORDS: &[(NewsSubtype, &[&str])] = &[
    (NewsSubtype::Sanctions, &["санкци", "эмбарго", "ограничени против", "запрет на экспорт"]),
    (NewsSubtype::Default, &["дефолт", "банкротств", "невыплат"]),
    (NewsSubtype::MnA, &["слияни", "поглощени", "купил долю", "приобрет", "m&a"]),
    (NewsSubtype::Guidance, &["прогноз", "ожидания менеджмента", "план по выручке"]),
    (NewsSubtype::Earnings, &["прибыл", "выручк", "отчетност", "финансовые результаты", "ebitda"]),
    (NewsSubtype::Hack, &["хакер", "кибератак", "взлом", "утечка данных"]),
    (NewsSubtype::Legal, &["суд", "иск", "арбитраж", "расследовани"]),
    (NewsSubtype::Esg, &["esg", "выбросы", "углеродн", "экологическ"]),
    (NewsSubtype::SupplyChain, &["цепочк поставок", "поставк", "перебои с поставками", "логистическ сбой"]),
    (NewsSubtype::TechOutage, &["сбой в работе", "недоступен сервис", "технический сбой"]),
    (NewsSubtype::ManagementChange, &["отставк", "назначен", "новый директор", "покинул пост", "смена руководства"]),
];

static REGULATORY_KEYWORDS: &[&str] = &[
    "цб", "центральный банк", "банк россии", "регулятор", "минфин", "законопроект",
    "постановлени", "указ", "антимонопольн", "фас",
];

static TAG_KEYWORDS: &[(&str, &[&str])] = &[
    ("dividends", &["дивиденд"]),
    ("buyback", &["обратный выкуп", "байбэк", "buyback"]),
    ("ipo", &["ipo", "первичное размещение"]),
    ("ai", &["искусственный интеллект", "нейросет", " ии "]),
    ("quarterly", &["квартал", "квартальн"]),
    ("rates", &["ключевая ставка", "ставк цб"]),
];

pub struct Classifier;

impl Classifier {
    pub fn new() -> Self {
        Self
    }

    /// `linked` carries `(ticker, sector_id)` of resolved companies, in link
    /// score order.
    pub fn classify(
        &self,
        title: &str,
        text: &str,
        lang: &str,
        linked: &[(String, Option<String>)],
    ) -> Classification {
        let haystack = format!("{} {}", title, text).to_lowercase();

        // Sector: linked issuer first, ticker map second, keywords last.
        let (sector, sector_confidence) = self.sector_of(&haystack, linked);

        let country = self.country_of(&haystack, lang);
        let subtype = self.subtype_of(&haystack);
        let news_type = self.type_of(&haystack, subtype, linked);

        let mut topics: Vec<(String, f64)> = Vec::new();
        if subtype != NewsSubtype::Other {
            topics.push((subtype.as_str().to_string(), 0.8));
        }
        for (tag, keywords) in TAG_KEYWORDS {
            if topics.len() >= 3 {
                break;
            }
            if topics.iter().any(|(code, _)| code == tag) {
                continue;
            }
            if keywords.iter().any(|kw| haystack.contains(kw)) {
                topics.push((tag.to_string(), 0.6));
            }
        }

        Classification {
            sector,
            sector_confidence,
            country,
            news_type,
            subtype,
            topics,
        }
    }

    fn sector_of(
        &self,
        haystack: &str,
        linked: &[(String, Option<String>)],
    ) -> (Option<String>, f64) {
        for (_, sector_id) in linked {
            if let Some(s) = sector_id {
                return (Some(s.clone()), 0.9);
            }
        }
        for (ticker, _) in linked {
            if let Some(s) = SECTOR_BY_TICKER.get(ticker.as_str()) {
                return (Some((*s).to_string()), 0.8);
            }
        }
        let mut best: Option<(&str, usize)> = None;
        for (code, keywords) in SECTOR_KEYWORDS {
            let hits = keywords.iter().filter(|kw| haystack.contains(**kw)).count();
            if hits > 0 && best.map(|(_, b)| hits > b).unwrap_or(true) {
                best = Some((code, hits));
            }
        }
        match best {
            Some((code, hits)) => (Some(code.to_string()), (0.4 + 0.1 * hits as f64).min(0.7)),
            None => (None, 0.0),
        }
    }

    fn country_of(&self, haystack: &str, lang: &str) -> String {
        for (code, patterns) in COUNTRY_PATTERNS {
            if patterns.iter().any(|p| haystack.contains(p)) {
                return (*code).to_string();
            }
        }
        if lang == "ru" {
            "RU".to_string()
        } else {
            "US".to_string()
        }
    }

    fn subtype_of(&self, haystack: &str) -> NewsSubtype {
        for (subtype, keywords) in SUBTYPE_KEYWORDS {
            if keywords.iter().any(|kw| haystack.contains(kw)) {
                return *subtype;
            }
        }
        NewsSubtype::Other
    }

    fn type_of(
        &self,
        haystack: &str,
        subtype: NewsSubtype,
        linked: &[(String, Option<String>)],
    ) -> NewsType {
        if subtype == NewsSubtype::Sanctions
            || REGULATORY_KEYWORDS.iter().any(|kw| haystack.contains(kw))
        {
            return NewsType::Regulatory;
        }
        if linked.len() == 1 {
            return NewsType::OneCompany;
        }
        NewsType::Market
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked(ticker: &str) -> Vec<(String, Option<String>)> {
        vec![(ticker.to_string(), None)]
    }

    #[test]
    fn earnings_news_for_one_bank() {
        let c = Classifier::new();
        let out = c.classify(
            "Сбербанк отчитался о рекордной прибыли",
            "Чистая прибыль банка по МСФО за квартал выросла на 12%.",
            "ru",
            &linked("SBER"),
        );
        assert_eq!(out.subtype, NewsSubtype::Earnings);
        assert_eq!(out.sector.as_deref(), Some("banks"));
        assert_eq!(out.country, "RU");
        assert!(out.topics.iter().any(|(code, _)| code == "earnings"));
        assert!(out.topics.iter().any(|(code, _)| code == "quarterly"));
        assert!(out.topics.len() <= 3);
    }

    #[test]
    fn sanctions_news_is_regulatory() {
        let c = Classifier::new();
        let out = c.classify(
            "США ввели санкции против российских банков",
            "Новый пакет ограничений затронет крупнейшие кредитные организации.",
            "ru",
            &[],
        );
        assert_eq!(out.subtype, NewsSubtype::Sanctions);
        assert_eq!(out.news_type, NewsType::Regulatory);
        // both countries appear; the first matching pattern wins
        assert_eq!(out.country, "RU");
    }

    #[test]
    fn linked_issuer_sector_wins_over_keywords() {
        let c = Classifier::new();
        let out = c.classify(
            "Компания расширяет сеть",
            "Новые магазины открыты в трех регионах, нефть тут ни при чем.",
            "ru",
            &[("MGNT".to_string(), Some("retail".to_string()))],
        );
        assert_eq!(out.sector.as_deref(), Some("retail"));
        assert!(out.sector_confidence >= 0.9);
        assert_eq!(out.news_type, NewsType::OneCompany);
    }

    #[test]
    fn market_news_without_companies() {
        let c = Classifier::new();
        let out = c.classify(
            "Индекс Мосбиржи вырос",
            "Рынок акций закрылся в плюсе на фоне роста нефтяных котировок.",
            "ru",
            &[],
        );
        assert_eq!(out.news_type, NewsType::Market);
        assert_eq!(out.subtype, NewsSubtype::Other);
        assert_eq!(out.country, "RU");
    }

    #[test]
    fn dividend_tag_detected() {
        let c = Classifier::new();
        let out = c.classify(
            "Совет директоров рекомендовал дивиденды",
            "Выплата составит 25 рублей на акцию по итогам года.",
            "ru",
            &linked("LKOH"),
        );
        assert!(out.topics.iter().any(|(code, _)| code == "dividends"));
        assert_eq!(out.sector.as_deref(), Some("oil_gas"));
    }
}
