//! Ingest pipeline behavior against an in-memory store: normalization,
//! antispam flagging, hash dedup, and the outbox co-write per kept item.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use uuid::Uuid;

use news_causal_engine::antispam::{default_rules, AntispamScorer, ItemShape};
use news_causal_engine::error::PipelineResult;
use news_causal_engine::ingest::types::FetchedItem;
use news_causal_engine::ingest::{process_batch, IngestOutcome};
use news_causal_engine::model::{News, OutboxEvent, ParserState, RawNews, Source, SourceKind};
use news_causal_engine::storage::{InsertOutcome, NewImage, NewsWriter, NoMedia};

#[derive(Default)]
struct MemoryWriter {
    news: Mutex<Vec<News>>,
    outbox: Mutex<Vec<OutboxEvent>>,
    hashes: Mutex<HashSet<String>>,
    external_ids: Mutex<HashSet<(Uuid, String)>>,
}

#[async_trait]
impl NewsWriter for MemoryWriter {
    async fn insert_news(
        &self,
        news: &News,
        _images: &[NewImage],
        outbox: &OutboxEvent,
    ) -> PipelineResult<InsertOutcome> {
        if !self.hashes.lock().insert(news.content_hash.clone()) {
            return Ok(InsertOutcome::DuplicateOnHash);
        }
        if !self
            .external_ids
            .lock()
            .insert((news.source_id, news.external_id.clone()))
        {
            return Ok(InsertOutcome::DuplicateOnExternalId);
        }
        self.news.lock().push(news.clone());
        self.outbox.lock().push(outbox.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn unenriched_backlog(&self) -> PipelineResult<u64> {
        Ok(self.news.lock().len() as u64)
    }

    async fn save_parser_state(&self, _source_id: Uuid, _state: &ParserState) -> PipelineResult<()> {
        Ok(())
    }

    async fn set_source_enabled(&self, _source_id: Uuid, _enabled: bool) -> PipelineResult<()> {
        Ok(())
    }
}

fn source(trust: u8) -> Source {
    Source {
        id: Uuid::new_v4(),
        code: "test".into(),
        kind: SourceKind::MessageChannel,
        display_name: "Test".into(),
        base_locator: "test".into(),
        trust_level: trust,
        enabled: true,
        config: serde_json::Value::Null,
        parser_state: ParserState::default(),
    }
}

fn item(source: &Source, external_id: &str, title: &str, text: &str) -> FetchedItem {
    FetchedItem {
        raw: RawNews {
            source_id: source.id,
            external_id: external_id.to_string(),
            title: title.to_string(),
            text: text.to_string(),
            summary: None,
            published_at: Utc::now(),
            url: None,
            media_refs: Vec::new(),
            raw_meta: serde_json::Value::Null,
        },
        shape: ItemShape::default(),
    }
}

fn scorer() -> AntispamScorer {
    AntispamScorer::new(5.0, 8.0, default_rules()).unwrap()
}

#[tokio::test]
async fn same_content_from_two_sources_persists_once() {
    let writer = MemoryWriter::default();
    let scorer = scorer();
    let src_a = source(5);
    let src_b = source(5);

    let title = "ЦБ повысил ключевую ставку до 16%";
    let text = "Совет директоров принял решение на плановом заседании.";

    let out_a = process_batch(&src_a, vec![item(&src_a, "1", title, text)], &scorer, &NoMedia, &writer)
        .await
        .unwrap();
    let out_b = process_batch(&src_b, vec![item(&src_b, "99", title, text)], &scorer, &NoMedia, &writer)
        .await
        .unwrap();

    assert_eq!(out_a.kept, 1);
    assert_eq!(out_b, IngestOutcome { kept: 0, duplicates: 1, ads_flagged: 0, malformed: 0 });

    // exactly one stored row and exactly one news.created outbox event
    assert_eq!(writer.news.lock().len(), 1);
    let outbox = writer.outbox.lock();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].topic, "news.created");
}

#[tokio::test]
async fn promo_item_is_flagged_but_kept_readable() {
    let writer = MemoryWriter::default();
    let scorer = scorer();
    let src = source(5);

    let out = process_batch(
        &src,
        vec![item(&src, "2", "Купи акции!", "Скидка 50%! Промокод внутри, успей купить сегодня!")],
        &scorer,
        &NoMedia,
        &writer,
    )
    .await
    .unwrap();

    assert_eq!(out.kept, 1);
    assert_eq!(out.ads_flagged, 1);
    let stored = writer.news.lock();
    assert!(stored[0].is_ad);
    assert!(stored[0].ad_score >= 5.0);
    assert!(!stored[0].ad_reasons.is_empty());
}

#[tokio::test]
async fn empty_item_is_malformed_not_persisted() {
    let writer = MemoryWriter::default();
    let scorer = scorer();
    let src = source(5);

    let out = process_batch(
        &src,
        vec![item(&src, "3", "  ", "<p></p>")],
        &scorer,
        &NoMedia,
        &writer,
    )
    .await
    .unwrap();

    assert_eq!(out.malformed, 1);
    assert_eq!(out.kept, 0);
    assert!(writer.news.lock().is_empty());
}

#[tokio::test]
async fn same_source_same_external_id_is_duplicate() {
    let writer = MemoryWriter::default();
    let scorer = scorer();
    let src = source(5);

    process_batch(
        &src,
        vec![item(&src, "7", "Первая версия заголовка", "Текст номер один про рынок.")],
        &scorer,
        &NoMedia,
        &writer,
    )
    .await
    .unwrap();

    // same external id, different content: caught by the (source, external) key
    let out = process_batch(
        &src,
        vec![item(&src, "7", "Обновленный заголовок", "Другой текст той же новости.")],
        &scorer,
        &NoMedia,
        &writer,
    )
    .await
    .unwrap();

    assert_eq!(out.duplicates, 1);
    assert_eq!(writer.news.lock().len(), 1);
}

#[tokio::test]
async fn trusted_source_passes_borderline_promo_wording() {
    let writer = MemoryWriter::default();
    let scorer = scorer();
    let src = source(8);

    let out = process_batch(
        &src,
        vec![item(
            &src,
            "4",
            "Ритейлер объявил распродажу",
            "Компания сообщила о сезонной распродаже, аналитики ждут роста выручки. Скидка достигает 30%.",
        )],
        &scorer,
        &NoMedia,
        &writer,
    )
    .await
    .unwrap();

    assert_eq!(out.ads_flagged, 0);
    assert!(!writer.news.lock()[0].is_ad);
}
