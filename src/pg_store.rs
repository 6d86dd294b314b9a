use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};

use crate::error::StoreError;
use crate::store::{Store, StoreResult};
use crate::types::{
    CanvasPosition, ChatbotState, Conversation, ConversationStatus, FlowConfig, FlowStep,
    KeywordRule, Lead, LeadStatus, Message, MessageType, Priority, StepBody, StepType, TagChange,
    Transition,
};

/// Postgres-backed store. Timestamps are fixed-width RFC 3339 text so that
/// lexical order matches time order.
#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        Ok(())
    }
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("timestamp '{raw}': {err}")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(raw: &str) -> StoreResult<T> {
    raw.parse::<T>().map_err(StoreError::Corrupt)
}

/// Turns unique-index violations into [`StoreError::Conflict`].
fn conflict_aware(err: sqlx::Error, what: &str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return StoreError::Conflict(what.to_string());
        }
    }
    StoreError::Database(err)
}

const LEAD_COLUMNS: &str =
    "id, phone, name, email, cpf, protocol, status, priority, created_at, updated_at";
const CONVERSATION_COLUMNS: &str =
    "id, lead_id, instance, status, current_step_id, last_activity_at, created_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, content, is_bot, message_type, metadata, external_id, created_at";
const STATE_COLUMNS: &str =
    "conversation_id, current_step_id, collected_data, is_permanent_handoff, handoff_until, updated_at";

fn lead_from_row(row: &PgRow) -> StoreResult<Lead> {
    Ok(Lead {
        id: row.try_get("id")?,
        phone: row.try_get("phone")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        cpf: row.try_get("cpf")?,
        protocol: row.try_get("protocol")?,
        status: parse_enum::<LeadStatus>(&row.try_get::<String, _>("status")?)?,
        priority: parse_enum::<Priority>(&row.try_get::<String, _>("priority")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn conversation_from_row(row: &PgRow) -> StoreResult<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        lead_id: row.try_get("lead_id")?,
        instance: row.try_get("instance")?,
        status: parse_enum::<ConversationStatus>(&row.try_get::<String, _>("status")?)?,
        current_step_id: row.try_get("current_step_id")?,
        last_activity_at: parse_ts(&row.try_get::<String, _>("last_activity_at")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn message_from_row(row: &PgRow) -> StoreResult<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        content: row.try_get("content")?,
        is_bot: row.try_get("is_bot")?,
        message_type: parse_enum::<MessageType>(&row.try_get::<String, _>("message_type")?)?,
        metadata: row.try_get::<Value, _>("metadata")?,
        external_id: row.try_get("external_id")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn state_from_row(row: &PgRow) -> StoreResult<ChatbotState> {
    let collected_data = match row.try_get::<Value, _>("collected_data")? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let handoff_until = row
        .try_get::<Option<String>, _>("handoff_until")?
        .map(|raw| parse_ts(&raw))
        .transpose()?;
    Ok(ChatbotState {
        conversation_id: row.try_get("conversation_id")?,
        current_step_id: row.try_get("current_step_id")?,
        collected_data,
        is_permanent_handoff: row.try_get("is_permanent_handoff")?,
        handoff_until,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn step_from_row(row: &PgRow) -> StoreResult<FlowStep> {
    let step_type = parse_enum::<StepType>(&row.try_get::<String, _>("step_type")?)?;
    let prompt: String = row.try_get("prompt")?;
    let transitions: Vec<Transition> =
        serde_json::from_value(row.try_get::<Value, _>("transitions")?)?;
    let buffer_seconds = row
        .try_get::<Option<i32>, _>("buffer_seconds")?
        .and_then(|value| u32::try_from(value).ok());
    Ok(FlowStep {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        objective: row.try_get("objective")?,
        body: StepBody::from_column(step_type, &prompt),
        routing_instructions: row.try_get("routing_instructions")?,
        transitions,
        buffer_seconds,
        change_status_to: TagChange::from_column(
            row.try_get::<Option<String>, _>("change_status_to")?.as_deref(),
        )
        .map_err(StoreError::Corrupt)?,
        change_priority_to: TagChange::from_column(
            row.try_get::<Option<String>, _>("change_priority_to")?.as_deref(),
        )
        .map_err(StoreError::Corrupt)?,
        position: CanvasPosition {
            x: row.try_get("canvas_x")?,
            y: row.try_get("canvas_y")?,
        },
    })
}

fn keyword_from_row(row: &PgRow) -> StoreResult<KeywordRule> {
    Ok(KeywordRule {
        id: row.try_get("id")?,
        step_id: row.try_get("step_id")?,
        keyword: row.try_get("keyword")?,
        target_step_id: row.try_get("target_step_id")?,
    })
}

impl PgStore {
    async fn hydrate_flow(&self, row: &PgRow) -> StoreResult<FlowConfig> {
        let flow_id: String = row.try_get("id")?;
        let step_rows = sqlx::query(
            "SELECT id, name, objective, step_type, prompt, routing_instructions, transitions, \
             buffer_seconds, change_status_to, change_priority_to, canvas_x, canvas_y \
             FROM flow_steps WHERE flow_id = $1 ORDER BY position_index ASC",
        )
        .bind(&flow_id)
        .fetch_all(&self.db)
        .await?;
        let keyword_rows = sqlx::query(
            "SELECT id, step_id, keyword, target_step_id \
             FROM keyword_rules WHERE flow_id = $1 ORDER BY position_index ASC",
        )
        .bind(&flow_id)
        .fetch_all(&self.db)
        .await?;

        Ok(FlowConfig {
            id: flow_id,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            global_prompt: row.try_get("global_prompt")?,
            active: row.try_get("active")?,
            steps: step_rows
                .iter()
                .map(step_from_row)
                .collect::<StoreResult<Vec<_>>>()?,
            keywords: keyword_rows
                .iter()
                .map(keyword_from_row)
                .collect::<StoreResult<Vec<_>>>()?,
            created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
            updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
        })
    }

    async fn write_flow_children(
        tx: &mut Transaction<'_, Postgres>,
        flow: &FlowConfig,
    ) -> StoreResult<()> {
        sqlx::query("DELETE FROM flow_steps WHERE flow_id = $1")
            .bind(&flow.id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM keyword_rules WHERE flow_id = $1")
            .bind(&flow.id)
            .execute(&mut **tx)
            .await?;

        for (index, step) in flow.steps.iter().enumerate() {
            sqlx::query(
                "INSERT INTO flow_steps (flow_id, id, position_index, name, objective, step_type, \
                 prompt, routing_instructions, transitions, buffer_seconds, change_status_to, \
                 change_priority_to, canvas_x, canvas_y) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)",
            )
            .bind(&flow.id)
            .bind(&step.id)
            .bind(index as i32)
            .bind(&step.name)
            .bind(&step.objective)
            .bind(step.body.step_type().as_str())
            .bind(step.body.to_column())
            .bind(&step.routing_instructions)
            .bind(serde_json::to_value(&step.transitions)?)
            .bind(step.buffer_seconds.map(|value| value as i32))
            .bind(step.change_status_to.to_column())
            .bind(step.change_priority_to.to_column())
            .bind(step.position.x)
            .bind(step.position.y)
            .execute(&mut **tx)
            .await
            .map_err(|err| conflict_aware(err, &format!("duplicate step id {}", step.id)))?;
        }

        for (index, rule) in flow.keywords.iter().enumerate() {
            sqlx::query(
                "INSERT INTO keyword_rules (flow_id, id, position_index, step_id, keyword, target_step_id) \
                 VALUES ($1,$2,$3,$4,$5,$6)",
            )
            .bind(&flow.id)
            .bind(&rule.id)
            .bind(index as i32)
            .bind(&rule.step_id)
            .bind(&rule.keyword)
            .bind(&rule.target_step_id)
            .execute(&mut **tx)
            .await
            .map_err(|err| conflict_aware(err, &format!("duplicate keyword rule {}", rule.id)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn find_lead_by_phone(&self, phone: &str) -> StoreResult<Option<Lead>> {
        let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM leads WHERE phone = $1"))
            .bind(phone)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(lead_from_row).transpose()
    }

    async fn get_lead(&self, lead_id: &str) -> StoreResult<Option<Lead>> {
        let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = $1"))
            .bind(lead_id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(lead_from_row).transpose()
    }

    async fn max_protocol_suffix(&self, year: i32) -> StoreResult<u32> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(CAST(split_part(protocol, '-', 2) AS INTEGER)), 0) AS suffix \
             FROM leads WHERE protocol LIKE $1",
        )
        .bind(format!("{year}-%"))
        .fetch_one(&self.db)
        .await?;
        let suffix: i32 = row.try_get("suffix")?;
        Ok(u32::try_from(suffix).unwrap_or(0))
    }

    async fn insert_lead(&self, lead: &Lead) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO leads ({LEAD_COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)"
        ))
        .bind(&lead.id)
        .bind(&lead.phone)
        .bind(&lead.name)
        .bind(&lead.email)
        .bind(&lead.cpf)
        .bind(&lead.protocol)
        .bind(lead.status.as_str())
        .bind(lead.priority.as_str())
        .bind(ts(lead.created_at))
        .bind(ts(lead.updated_at))
        .execute(&self.db)
        .await
        .map_err(|err| conflict_aware(err, &format!("lead {} / {}", lead.phone, lead.protocol)))?;
        Ok(())
    }

    async fn update_lead_tags(
        &self,
        lead_id: &str,
        status: Option<LeadStatus>,
        priority: Option<Priority>,
    ) -> StoreResult<Lead> {
        let row = sqlx::query(&format!(
            "UPDATE leads SET status = COALESCE($2, status), priority = COALESCE($3, priority), \
             updated_at = $4 WHERE id = $1 RETURNING {LEAD_COLUMNS}"
        ))
        .bind(lead_id)
        .bind(status.map(LeadStatus::as_str))
        .bind(priority.map(Priority::as_str))
        .bind(ts(Utc::now()))
        .fetch_optional(&self.db)
        .await?;
        match row {
            Some(row) => lead_from_row(&row),
            None => Err(StoreError::NotFound(format!("lead {lead_id}"))),
        }
    }

    async fn update_lead_name(&self, lead_id: &str, name: &str) -> StoreResult<()> {
        sqlx::query("UPDATE leads SET name = $2, updated_at = $3 WHERE id = $1")
            .bind(lead_id)
            .bind(name)
            .bind(ts(Utc::now()))
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn clear_leads(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM leads").execute(&self.db).await?;
        Ok(result.rows_affected())
    }

    async fn get_conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(conversation_id)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn find_open_conversation(&self, lead_id: &str) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE lead_id = $1 AND status <> 'closed' ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(lead_id)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO conversations ({CONVERSATION_COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6,$7)"
        ))
        .bind(&conversation.id)
        .bind(&conversation.lead_id)
        .bind(&conversation.instance)
        .bind(conversation.status.as_str())
        .bind(&conversation.current_step_id)
        .bind(ts(conversation.last_activity_at))
        .bind(ts(conversation.created_at))
        .execute(&self.db)
        .await
        .map_err(|err| {
            conflict_aware(
                err,
                &format!("lead {} already has an open conversation", conversation.lead_id),
            )
        })?;
        Ok(())
    }

    async fn touch_conversation(&self, conversation_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE conversations SET last_activity_at = $2 WHERE id = $1")
            .bind(conversation_id)
            .bind(ts(at))
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("conversation {conversation_id}")));
        }
        Ok(())
    }

    async fn advance_conversation(
        &self,
        conversation_id: &str,
        step_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Conversation> {
        let row = sqlx::query(&format!(
            "UPDATE conversations SET current_step_id = $2, last_activity_at = $3 \
             WHERE id = $1 RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(conversation_id)
        .bind(step_id)
        .bind(ts(at))
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
        conversation_from_row(&row)
    }

    async fn set_conversation_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Conversation> {
        let row = sqlx::query(&format!(
            "UPDATE conversations SET status = $2, last_activity_at = $3 \
             WHERE id = $1 RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(conversation_id)
        .bind(status.as_str())
        .bind(ts(at))
        .fetch_optional(&self.db)
        .await
        .map_err(|err| conflict_aware(err, "lead already has an open conversation"))?
        .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
        conversation_from_row(&row)
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)"
        ))
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(&message.content)
        .bind(message.is_bot)
        .bind(message.message_type.as_str())
        .bind(&message.metadata)
        .bind(&message.external_id)
        .bind(ts(message.created_at))
        .execute(&self.db)
        .await
        .map_err(|err| {
            conflict_aware(
                err,
                &format!("message {}", message.external_id.as_deref().unwrap_or(&message.id)),
            )
        })?;
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 \
             ORDER BY created_at ASC"
        ))
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 \
             ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(conversation_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.db)
        .await?;
        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn get_state(&self, conversation_id: &str) -> StoreResult<Option<ChatbotState>> {
        let row = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM chatbot_states WHERE conversation_id = $1"
        ))
        .bind(conversation_id)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(state_from_row).transpose()
    }

    async fn save_progress(
        &self,
        conversation_id: &str,
        step_id: Option<&str>,
        collected_data: &Map<String, Value>,
    ) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO chatbot_states ({STATE_COLUMNS}) VALUES ($1,$2,$3,FALSE,NULL,$4) \
             ON CONFLICT (conversation_id) DO UPDATE SET \
             current_step_id = EXCLUDED.current_step_id, \
             collected_data = EXCLUDED.collected_data, \
             updated_at = EXCLUDED.updated_at"
        ))
        .bind(conversation_id)
        .bind(step_id)
        .bind(Value::Object(collected_data.clone()))
        .bind(ts(Utc::now()))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn upsert_handoff(
        &self,
        conversation_id: &str,
        permanent: bool,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO chatbot_states ({STATE_COLUMNS}) VALUES ($1,NULL,'{{}}'::jsonb,$2,$3,$4) \
             ON CONFLICT (conversation_id) DO UPDATE SET \
             is_permanent_handoff = EXCLUDED.is_permanent_handoff, \
             handoff_until = EXCLUDED.handoff_until, \
             updated_at = EXCLUDED.updated_at"
        ))
        .bind(conversation_id)
        .bind(permanent)
        .bind(until.map(ts))
        .bind(ts(Utc::now()))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn set_handoff(
        &self,
        conversation_id: &str,
        permanent: bool,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE chatbot_states SET is_permanent_handoff = $2, handoff_until = $3, \
             updated_at = $4 WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .bind(permanent)
        .bind(until.map(ts))
        .bind(ts(Utc::now()))
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn suspended_states(&self) -> StoreResult<Vec<ChatbotState>> {
        let rows = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM chatbot_states \
             WHERE is_permanent_handoff OR handoff_until IS NOT NULL"
        ))
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(state_from_row).collect()
    }

    async fn list_flows(&self) -> StoreResult<Vec<FlowConfig>> {
        let rows = sqlx::query(
            "SELECT id, name, version, global_prompt, active, created_at, updated_at \
             FROM flow_configs ORDER BY created_at ASC",
        )
        .fetch_all(&self.db)
        .await?;
        let mut flows = Vec::with_capacity(rows.len());
        for row in &rows {
            flows.push(self.hydrate_flow(row).await?);
        }
        Ok(flows)
    }

    async fn get_flow(&self, flow_id: &str) -> StoreResult<Option<FlowConfig>> {
        let row = sqlx::query(
            "SELECT id, name, version, global_prompt, active, created_at, updated_at \
             FROM flow_configs WHERE id = $1",
        )
        .bind(flow_id)
        .fetch_optional(&self.db)
        .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate_flow(&row).await?)),
            None => Ok(None),
        }
    }

    async fn active_flow(&self) -> StoreResult<Option<FlowConfig>> {
        let row = sqlx::query(
            "SELECT id, name, version, global_prompt, active, created_at, updated_at \
             FROM flow_configs WHERE active LIMIT 1",
        )
        .fetch_optional(&self.db)
        .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate_flow(&row).await?)),
            None => Ok(None),
        }
    }

    async fn save_flow(&self, flow: &FlowConfig) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO flow_configs (id, name, version, global_prompt, active, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, version = EXCLUDED.version, \
             global_prompt = EXCLUDED.global_prompt, active = EXCLUDED.active, \
             updated_at = EXCLUDED.updated_at",
        )
        .bind(&flow.id)
        .bind(&flow.name)
        .bind(flow.version)
        .bind(&flow.global_prompt)
        .bind(flow.active)
        .bind(ts(flow.created_at))
        .bind(ts(flow.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(|err| conflict_aware(err, "another flow is already active"))?;
        Self::write_flow_children(&mut tx, flow).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn activate_flow(&self, flow_id: &str) -> StoreResult<FlowConfig> {
        let now = ts(Utc::now());
        let mut tx = self.db.begin().await?;
        sqlx::query("UPDATE flow_configs SET active = FALSE, updated_at = $2 WHERE active AND id <> $1")
            .bind(flow_id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        let updated = sqlx::query(
            "UPDATE flow_configs SET active = TRUE, updated_at = $2 WHERE id = $1",
        )
        .bind(flow_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound(format!("flow {flow_id}")));
        }
        tx.commit().await?;
        self.get_flow(flow_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("flow {flow_id}")))
    }
}
