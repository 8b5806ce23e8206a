// src/events/extractor.rs
//! Typed event extraction. An ordered table of regex families maps news text
//! to event types; each detected type becomes one event carrying the
//! entities and tickers the enrichment produced.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::enrich::extractor::Extraction;
use crate::model::{Event, EventAttrs};

/// Marker families, one per event type. Order inside the table is the
/// tie-break priority when more types match than the per-news cap allows.
struct TypeFamily {
    event_type: &'static str,
    priority: i32,
    patterns: &'static [&'static str],
}

static FAMILIES: &[TypeFamily] = &[
    TypeFamily {
        event_type: "sanctions",
        priority: 10,
        patterns: &[r"санкци", r"эмбарго", r"включил[аи]? в список", r"запрет на (экспорт|импорт)", r"\bsanctions\b"],
    },
    TypeFamily {
        event_type: "rate_hike",
        priority: 9,
        patterns: &[r"повы[сш][а-яё]* (ключевую )?ставк", r"ключев[ао][яй] ставка повышена", r"цб повысил", r"rate hike", r"raised rates?"],
    },
    TypeFamily {
        event_type: "rate_cut",
        priority: 9,
        patterns: &[r"сни[зж][а-яё]* (ключевую )?ставк", r"ставка снижена", r"понижение ставки", r"rate cut"],
    },
    TypeFamily {
        event_type: "default",
        priority: 9,
        patterns: &[r"дефолт", r"банкротств", r"невыплат[аы]"],
    },
    TypeFamily {
        event_type: "earnings_miss",
        priority: 8,
        patterns: &[r"убыток", r"снижение прибыли", r"падение прибыли", r"прибыль (упала|сократилась)"],
    },
    TypeFamily {
        event_type: "earnings_beat",
        priority: 8,
        patterns: &[r"рост прибыли", r"рекордн[ао][яй] прибыл", r"прибыль выросла", r"увеличение прибыли"],
    },
    TypeFamily {
        event_type: "mna",
        priority: 8,
        patterns: &[r"слияни", r"поглощени", r"купил[аи]? долю", r"приобрет[ае]", r"\bm&a\b", r"takeover"],
    },
    TypeFamily {
        event_type: "ipo",
        priority: 8,
        patterns: &[r"\bipo\b", r"первичное размещение"],
    },
    TypeFamily {
        event_type: "guidance_cut",
        priority: 7,
        patterns: &[r"снизил[аи]? прогноз", r"ухудшил[аи]? прогноз", r"пересмотрел[аи]? прогноз"],
    },
    TypeFamily {
        event_type: "dividend_cut",
        priority: 7,
        patterns: &[r"сократил[аи]? дивиденды", r"снизил[аи]? дивиденды", r"отказался от дивидендов"],
    },
    TypeFamily {
        event_type: "stock_drop",
        priority: 7,
        patterns: &[r"акци[а-яё]*[^.!?]{0,40}(упали|снизились|подешевели|рухнули)", r"(падение|обвал) (акций|котировок)"],
    },
    TypeFamily {
        event_type: "stock_rally",
        priority: 7,
        patterns: &[r"акци[а-яё]*[^.!?]{0,40}(выросли|подорожали|взлетели)", r"рост (акций|котировок)"],
    },
    TypeFamily {
        event_type: "rub_appreciation",
        priority: 7,
        patterns: &[r"рубль укрепи", r"укрепление рубля"],
    },
    TypeFamily {
        event_type: "rub_depreciation",
        priority: 7,
        patterns: &[r"рубль (ослаб|упал)", r"ослабление рубля"],
    },
    TypeFamily {
        event_type: "market_drop",
        priority: 7,
        patterns: &[r"(рынок|индекс)[^.!?]{0,40}(упал|снизился|рухнул)", r"обвал рынка"],
    },
    TypeFamily {
        event_type: "earnings",
        priority: 6,
        patterns: &[r"прибыл", r"выручк", r"отчетност", r"финансовые результаты", r"ebitda"],
    },
    TypeFamily {
        event_type: "guidance",
        priority: 5,
        patterns: &[r"прогноз", r"ожидает", r"планирует"],
    },
    TypeFamily {
        event_type: "dividends",
        priority: 5,
        patterns: &[r"дивиденд"],
    },
    TypeFamily {
        event_type: "buyback",
        priority: 5,
        patterns: &[r"обратн[ыо][йг] выкуп", r"байбэк", r"buyback"],
    },
    TypeFamily {
        event_type: "regulatory",
        priority: 5,
        patterns: &[r"регулятор", r"законопроект", r"постановлени", r"указ", r"антимонопольн"],
    },
    TypeFamily {
        event_type: "legal",
        priority: 4,
        patterns: &[r"\bсуд\b", r"судебн", r"\bиск\b", r"арбитраж"],
    },
    TypeFamily {
        event_type: "management_change",
        priority: 4,
        patterns: &[r"смена руководства", r"назначен[аы]?", r"ушел в отставку", r"покинул пост", r"новый (генеральный )?директор"],
    },
    TypeFamily {
        event_type: "supply_chain",
        priority: 4,
        patterns: &[r"цепочк[аи] поставок", r"задержк[аи] поставок", r"перебои с поставками"],
    },
    TypeFamily {
        event_type: "production",
        priority: 3,
        patterns: &[r"производств", r"добыч[аи]", r"выпуск продукции", r"мощност"],
    },
    TypeFamily {
        event_type: "accident",
        priority: 6,
        patterns: &[r"авари", r"инцидент", r"катастроф", r"\bчп\b"],
    },
    TypeFamily {
        event_type: "strike",
        priority: 4,
        patterns: &[r"забастовк", r"остановка работы"],
    },
];

static COMPILED: Lazy<Vec<(usize, Regex)>> = Lazy::new(|| {
    FAMILIES
        .iter()
        .enumerate()
        .map(|(i, fam)| {
            let joined = fam.patterns.join("|");
            (i, Regex::new(&format!("(?i)(?:{joined})")).expect("event family regex"))
        })
        .collect()
});

/// Types detected in a text, highest priority first, table order as tie-break.
pub fn detect_event_types(text_lower: &str) -> Vec<&'static str> {
    let mut hits: Vec<(i32, usize, &'static str)> = Vec::new();
    for (idx, re) in COMPILED.iter() {
        if re.is_match(text_lower) {
            let fam = &FAMILIES[*idx];
            hits.push((fam.priority, *idx, fam.event_type));
        }
    }
    hits.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    hits.into_iter().map(|(_, _, t)| t).collect()
}

fn marker_hits(event_type: &str, text_lower: &str) -> usize {
    COMPILED
        .iter()
        .find(|(idx, _)| FAMILIES[*idx].event_type == event_type)
        .map(|(_, re)| re.find_iter(text_lower).count())
        .unwrap_or(0)
}

/// First sentence containing a marker of the type; falls back to the title.
fn event_title(event_type: &str, title: &str, text: &str) -> String {
    let re = COMPILED
        .iter()
        .find(|(idx, _)| FAMILIES[*idx].event_type == event_type)
        .map(|(_, re)| re);
    if let Some(re) = re {
        for sentence in text.split_inclusive(['.', '!', '?']) {
            if re.is_match(&sentence.to_lowercase()) {
                let s = sentence.trim().trim_end_matches(['.', '!', '?']).trim();
                if !s.is_empty() {
                    return s.to_string();
                }
            }
        }
    }
    title.to_string()
}

pub struct EventExtractor {
    anchor_types: Vec<String>,
    max_events: usize,
}

impl EventExtractor {
    pub fn new(anchor_types: Vec<String>, max_events: usize) -> Self {
        Self {
            anchor_types,
            max_events: max_events.clamp(1, 5),
        }
    }

    /// Build typed events for one news item. `tickers` is the union of linked
    /// company tickers and extractor-provided ones.
    #[allow(clippy::too_many_arguments)]
    pub fn extract(
        &self,
        news_id: Uuid,
        title: &str,
        text: &str,
        published_at: DateTime<Utc>,
        extraction: &Extraction,
        tickers: &[String],
        source_trust: u8,
    ) -> Vec<Event> {
        let full = format!("{} {}", title, text);
        let full_lower = full.to_lowercase();

        let mut types = detect_event_types(&full_lower);
        // Extractor hints extend, never override, the marker table.
        for hint in &extraction.event_types {
            if !types.iter().any(|t| *t == hint.as_str()) {
                if let Some(known) = FAMILIES.iter().find(|f| f.event_type == hint.as_str()) {
                    types.push(known.event_type);
                }
            }
        }
        types.truncate(self.max_events);

        let attrs = EventAttrs {
            companies: extraction.companies.iter().map(|c| c.name.clone()).collect(),
            tickers: tickers.to_vec(),
            people: extraction
                .people
                .iter()
                .map(|p| serde_json::to_value(p).unwrap_or_default())
                .collect(),
            markets: extraction
                .markets
                .iter()
                .map(|m| serde_json::to_value(m).unwrap_or_default())
                .collect(),
            metrics: extraction
                .financial_metrics
                .iter()
                .map(|m| serde_json::to_value(m).unwrap_or_default())
                .collect(),
        };

        types
            .into_iter()
            .map(|event_type| {
                let confidence = self.confidence(event_type, &full_lower);
                let is_anchor = self.is_anchor(event_type, confidence, source_trust);
                Event {
                    id: Uuid::new_v4(),
                    news_id,
                    event_type: event_type.to_string(),
                    title: event_title(event_type, title, &full),
                    ts: published_at,
                    attrs: attrs.clone(),
                    is_anchor,
                    confidence,
                }
            })
            .collect()
    }

    fn confidence(&self, event_type: &str, text_lower: &str) -> f64 {
        let hits = marker_hits(event_type, text_lower);
        let extra = hits.saturating_sub(1) as f64;
        (0.7 + (extra * 0.1).min(0.2)).clamp(0.5, 0.95)
    }

    fn is_anchor(&self, event_type: &str, confidence: f64, source_trust: u8) -> bool {
        self.anchor_types.iter().any(|t| t == event_type) && confidence >= 0.7 && source_trust >= 7
    }
}
