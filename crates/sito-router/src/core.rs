//! RouterCore: the operations a stage runs against
//!
//! A RouterCore is built per consume invocation, adopts the incoming packet,
//! and owns it until the next hop is published; between hops the packet is
//! the only state, carried by the broker. Stages hold a RouterCore by
//! composition and call its operations; there is no stage base class.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use sito_broker::{BrokerAdapter, DelayScheduler, DelaySpec};
use sito_common::{
    Clock, MessagePacket, PacketCodec, PacketSettings, PublishArgs, RetryEvent, SitoReturn,
    ABORT_CLASS, DEFAULT_ABORT_CLASS, RETRY_CLASS, STATUS_ABORTED, STATUS_RETRY_SUFFIX, TAG_RETRY,
};
use sito_config::{ClassKind, RouterSettings};
use sito_dbqueue::{tag_mutation, DbMutation, DbStatement, DbUpdatePublisher, RequestUpdate};

use crate::collab::{MacroExpander, MessageTextSource, TextLookup};
use crate::route::{self, NextClass};
use crate::{expand, Result, RouterError};

/// Shared handles a RouterCore operates with; one per worker process,
/// cloned into every stage invocation.
#[derive(Clone)]
pub struct RouterContext {
    pub config: Arc<RouterSettings>,
    pub adapter: Arc<BrokerAdapter>,
    pub delay: Arc<DelayScheduler>,
    pub db: Arc<DbUpdatePublisher>,
    pub clock: Arc<dyn Clock>,
    pub text_source: Option<Arc<dyn MessageTextSource>>,
    pub expander: Option<Arc<dyn MacroExpander>>,
}

impl RouterContext {
    pub fn codec(&self) -> PacketCodec {
        PacketCodec::new(
            self.config.settings_key.as_str(),
            self.config.cargo_key.as_str(),
        )
    }
}

/// Inputs to `publish_abort`. The failing class name is mandatory; exactly
/// one of sito_return / message_text / message_name normally carries the
/// reason.
pub struct AbortArgs<'a> {
    pub class_name: &'a str,
    pub sito_return: Option<SitoReturn>,
    pub message_text: Option<String>,
    pub message_name: Option<String>,
    pub request_status: Option<String>,
    /// Extra request-row columns upserted alongside the standard ones.
    pub request_cols: Map<String, Value>,
    pub request_id: Option<String>,
}

impl<'a> AbortArgs<'a> {
    pub fn new(class_name: &'a str) -> Self {
        Self {
            class_name,
            sito_return: None,
            message_text: None,
            message_name: None,
            request_status: None,
            request_cols: Map::new(),
            request_id: None,
        }
    }

    pub fn sito_return(mut self, error: SitoReturn) -> Self {
        self.sito_return = Some(error);
        self
    }

    pub fn message_text(mut self, text: impl Into<String>) -> Self {
        self.message_text = Some(text.into());
        self
    }

    pub fn message_name(mut self, name: impl Into<String>) -> Self {
        self.message_name = Some(name.into());
        self
    }

    pub fn request_status(mut self, status: impl Into<String>) -> Self {
        self.request_status = Some(status.into());
        self
    }
}

pub struct RouterCore {
    ctx: RouterContext,
    codec: PacketCodec,
    /// Substitution source for `%%ident%%` tokens in publish args.
    fields: Map<String, Value>,
    packet: Option<MessagePacket>,
}

impl RouterCore {
    pub fn new(ctx: RouterContext) -> Self {
        let codec = ctx.codec();
        Self {
            ctx,
            codec,
            fields: Map::new(),
            packet: None,
        }
    }

    pub fn context(&self) -> &RouterContext {
        &self.ctx
    }

    /// Take ownership of a packet decoded from an incoming delivery.
    pub fn adopt(&mut self, packet: MessagePacket) {
        self.packet = Some(packet);
    }

    pub fn packet(&self) -> Result<&MessagePacket> {
        self.packet
            .as_ref()
            .ok_or_else(|| RouterError::OutOfSequence("no packet adopted".into()))
    }

    pub fn packet_mut(&mut self) -> Result<&mut MessagePacket> {
        self.packet
            .as_mut()
            .ok_or_else(|| RouterError::OutOfSequence("no packet adopted".into()))
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Assign the persistent request row id; set exactly once per request.
    pub fn assign_record_id(&mut self, record_id: &str) -> Result<()> {
        let settings = &mut self.packet_mut()?.settings;
        match &settings.record_id {
            None => {
                settings.record_id = Some(record_id.to_string());
                Ok(())
            }
            Some(existing) if existing == record_id => Ok(()),
            Some(existing) => Err(RouterError::OutOfSequence(format!(
                "record_id already assigned as '{existing}'"
            ))),
        }
    }

    /// Where the route goes next, without publishing.
    pub fn peek_next(&self) -> Result<NextClass> {
        let settings = &self.packet()?.settings;
        route::next_class(&settings.process_route, &settings.history)
    }

    /// Begin a flow on a work class: validate, build the packet settings by
    /// spreading the class parameters under any caller-supplied initial
    /// settings, and publish the first stage.
    pub async fn publish_start(
        &mut self,
        class_name: &str,
        cargo: Value,
        initial: Option<Map<String, Value>>,
    ) -> Result<()> {
        let class = self
            .ctx
            .config
            .registry
            .get(class_name)
            .filter(|c| c.kind == ClassKind::Work)
            .ok_or_else(|| RouterError::UnknownWorkClass(class_name.to_string()))?;

        let process_route = class.process_route.clone().unwrap_or_default();
        if process_route.is_empty() {
            return Err(RouterError::NoProcessRoute(class_name.to_string()));
        }
        if cargo.is_null() {
            return Err(RouterError::MissingInput("cargo".to_string()));
        }

        let mut settings = PacketSettings {
            process_route,
            task_start: Some(self.ctx.clock.epoch()),
            abort_route: class.abort_route.clone(),
            ..Default::default()
        };

        let mut overlay = class.params.clone();
        if let Some(default_common) = &class.default_common {
            overlay.insert("default_common".into(), default_common.clone());
        }
        if let Some(min_delay) = class.min_delay {
            overlay.insert("min_delay".into(), Value::from(min_delay));
        }
        settings.overlay(overlay)?;
        if let Some(initial) = initial {
            settings.overlay(initial)?;
        }

        info!(class = %class_name, "Starting flow");
        self.packet = Some(MessagePacket::new(cargo, settings));
        self.publish_next(None).await.map(|_| ())
    }

    /// Advance one stage: resolve the next class and its publish args,
    /// append it to history, and hand the serialized packet to the broker
    /// (or the delay scheduler when a delay is requested). Returns the
    /// published class, or None at the normal end of the route.
    pub async fn publish_next(&mut self, delay: Option<u64>) -> Result<Option<String>> {
        let (name, mut args, min_delay) = {
            let settings = &self.packet()?.settings;
            let next = route::next_class(&settings.process_route, &settings.history)?;
            let NextClass::Next { name, .. } = next else {
                info!(
                    history = ?settings.history,
                    record_id = ?settings.record_id,
                    "Normal end of process route"
                );
                return Ok(None);
            };

            let class = self.ctx.config.registry.get(&name);
            let args = match settings.route_args.get(&name) {
                Some(stored) => stored.clone(),
                None => {
                    let class =
                        class.ok_or_else(|| RouterError::NotExchangeClass(name.clone()))?;
                    let routing_key = class
                        .queue
                        .clone()
                        .or_else(|| class.route_key.clone())
                        .unwrap_or_default();
                    PublishArgs::new(class.exchange.clone(), routing_key)
                }
            };
            (name, args, class.and_then(|c| c.min_delay).unwrap_or(0))
        };

        expand::expand_publish_args(&self.fields, &mut args);

        let payload = {
            let codec = &self.codec;
            let packet = self
                .packet
                .as_mut()
                .ok_or_else(|| RouterError::OutOfSequence("no packet adopted".into()))?;
            packet.settings.history.push(name.clone());
            codec.encode(packet)?
        };

        match delay {
            Some(seconds) if (seconds as i64) >= min_delay => {
                debug!(class = %name, delay = seconds, "Scheduling delayed hop");
                self.ctx
                    .delay
                    .publish_delayed(
                        DelaySpec::ExpireDelta(seconds as i64),
                        &args.exchange,
                        &args.routing_key,
                        &payload,
                    )
                    .await?;
            }
            Some(seconds) => {
                debug!(
                    class = %name,
                    delay = seconds,
                    min_delay = min_delay,
                    "Delay below class minimum, publishing immediately"
                );
                self.ctx
                    .adapter
                    .publish(&args.exchange, &args.routing_key, &payload)
                    .await?;
            }
            None => {
                self.ctx
                    .adapter
                    .publish(&args.exchange, &args.routing_key, &payload)
                    .await?;
            }
        }

        info!(class = %name, exchange = %args.exchange, routing_key = %args.routing_key, "Published stage");
        Ok(Some(name))
    }

    /// Sidebar publish to a notify class. The class is inserted into the
    /// route at the current position and recorded in history so the
    /// prefix-match still holds on the next publish_next. Does not touch
    /// retry counters.
    pub async fn publish_notify(&mut self, class_name: &str, route_key: &str) -> Result<()> {
        let exchange = self
            .ctx
            .config
            .registry
            .get(class_name)
            .filter(|c| c.kind == ClassKind::Notify)
            .map(|c| c.exchange.clone())
            .ok_or_else(|| RouterError::UnknownNotifyClass(class_name.to_string()))?;

        let payload = {
            let codec = &self.codec;
            let packet = self
                .packet
                .as_mut()
                .ok_or_else(|| RouterError::OutOfSequence("no packet adopted".into()))?;
            let settings = &mut packet.settings;
            let position =
                match route::next_class(&settings.process_route, &settings.history)? {
                    NextClass::Next { position, .. } => position,
                    NextClass::Terminal => settings.process_route.len(),
                };
            settings
                .process_route
                .insert(position, class_name.to_string());
            settings.history.push(class_name.to_string());
            codec.encode(packet)?
        };

        self.ctx
            .adapter
            .publish(&exchange, route_key, &payload)
            .await?;
        info!(class = %class_name, exchange = %exchange, route_key = %route_key, "Published notify");
        Ok(())
    }

    /// Insert a class immediately before the next one in the route. Any
    /// publish args supplied are stored for that class's hop.
    pub fn set_branch_class(
        &mut self,
        class_name: &str,
        publish_args: Option<PublishArgs>,
    ) -> Result<()> {
        if publish_args.is_none() && self.ctx.config.registry.get(class_name).is_none() {
            return Err(RouterError::NotExchangeClass(class_name.to_string()));
        }

        let settings = &mut self.packet_mut()?.settings;
        let position = match route::next_class(&settings.process_route, &settings.history)? {
            NextClass::Next { position, .. } => position,
            NextClass::Terminal => settings.process_route.len(),
        };
        if let Some(args) = publish_args {
            settings.route_args.insert(class_name.to_string(), args);
        }
        settings
            .process_route
            .insert(position, class_name.to_string());
        debug!(class = %class_name, position = position, "Branched route");
        Ok(())
    }

    /// Divert to the retry or abort path after a stage failure.
    ///
    /// Retries when the failing class declares a positive retry_max, the
    /// consumer marked the packet retry_ready, and attempts remain; the
    /// route gets the failing class re-inserted behind a Retry sentinel and
    /// the hop is republished after retry_seconds. Otherwise the route is
    /// cut over to the abort route behind an Abort sentinel. Either way the
    /// request row and tags are updated in one DB-queue transaction keyed
    /// by the record id before the next hop is published.
    pub async fn publish_abort(&mut self, args: AbortArgs<'_>) -> Result<()> {
        let (retry_max, retry_seconds, class_abort_route) = {
            let class = self.ctx.config.registry.get(args.class_name);
            (
                class.and_then(|c| c.retry_max).unwrap_or(0),
                class.and_then(|c| c.retry_seconds).unwrap_or(0),
                class.and_then(|c| c.abort_route.clone()),
            )
        };

        let (retrying, system_id) = {
            let settings = &self.packet()?.settings;
            let retrying = retry_max > 0
                && settings.retry_ready
                && settings.retries_of(args.class_name) < retry_max;
            (retrying, settings.system_id.clone())
        };

        let detail = self.compose_detail(&args, system_id.as_deref()).await;
        let now = self.ctx.clock.epoch();

        {
            let settings = &mut self.packet_mut()?.settings;

            if let Some(request_id) = &args.request_id {
                match &settings.record_id {
                    None => settings.record_id = Some(request_id.clone()),
                    Some(existing) if existing != request_id => {
                        return Err(RouterError::OutOfSequence(format!(
                            "record_id already assigned as '{existing}'"
                        )))
                    }
                    _ => {}
                }
            }
            if let Some(sito_return) = &args.sito_return {
                settings.sito_return = Some(sito_return.clone());
            }

            let position = route::last_position(&settings.process_route, &settings.history)?
                .ok_or_else(|| {
                    RouterError::OutOfSequence("publish_abort before any stage ran".into())
                })?;

            if retrying {
                settings.process_route = route::splice_retry(&settings.process_route, position);
                settings.history.push(RETRY_CLASS.to_string());
                let event = RetryEvent {
                    epoch: now,
                    code: args
                        .sito_return
                        .as_ref()
                        .map(|r| r.code.clone())
                        .unwrap_or_else(|| "RETRY".to_string()),
                    description: detail.clone(),
                };
                settings.record_retry(args.class_name, event);
                warn!(
                    class = %args.class_name,
                    attempt = settings.retries_of(args.class_name),
                    retry_max = retry_max,
                    "Stage failed, retry scheduled"
                );
            } else {
                let abort_route = settings
                    .abort_route
                    .clone()
                    .or(class_abort_route)
                    .unwrap_or_else(|| vec![DEFAULT_ABORT_CLASS.to_string()]);
                settings.process_route =
                    route::splice_abort(&settings.process_route, position, &abort_route);
                settings.history.push(ABORT_CLASS.to_string());
                warn!(class = %args.class_name, abort_route = ?abort_route, "Stage failed, aborting");
            }

            settings.request_status_detail = Some(detail.clone());
            let mut status = args
                .request_status
                .clone()
                .or_else(|| settings.abort_status.clone())
                .unwrap_or_else(|| STATUS_ABORTED.to_string());
            if retrying {
                status.push_str(STATUS_RETRY_SUFFIX);
            }
            settings.state = Some(status.clone());
            settings.request_status = Some(status);
        }

        self.persist_abort(&args, retrying).await?;

        if retrying {
            self.publish_next(Some(retry_seconds)).await?;
        } else {
            self.publish_next(None).await?;
        }
        Ok(())
    }

    /// Request-row + tag updates for an abort/retry, in one transaction.
    /// Skipped entirely when no request row exists yet.
    async fn persist_abort(&self, args: &AbortArgs<'_>, retrying: bool) -> Result<()> {
        let packet = self.packet()?;
        let settings = &packet.settings;
        let Some(record_id) = settings.record_id.clone() else {
            debug!(class = %args.class_name, "No record id yet, skipping request update");
            return Ok(());
        };

        let mut records: Vec<DbMutation> = Vec::new();
        if !args.request_cols.is_empty() {
            let mut columns = vec!["id".to_string()];
            let mut values = vec![Value::from(record_id.as_str())];
            for (column, value) in &args.request_cols {
                columns.push(column.clone());
                values.push(value.clone());
            }
            records.push(DbMutation::Insert(DbStatement {
                db_name: sito_dbqueue::REQUEST_DB.into(),
                table: sito_dbqueue::REQUEST_TABLE.into(),
                columns,
                values,
                where_clause: None,
                sql_macro: None,
                task_start: 0,
                transaction_id: None,
            }));
        }
        if retrying {
            let history = settings
                .retry_history
                .get(args.class_name)
                .cloned()
                .unwrap_or_default();
            let rendered = serde_json::to_value(history)
                .map_err(sito_common::CodecError::Encode)
                .map_err(RouterError::Codec)?;
            records.push(tag_mutation(
                &record_id,
                settings.system_id.as_deref().unwrap_or_default(),
                TAG_RETRY,
                rendered,
                0,
                0,
                "",
            )?);
        }

        self.ctx
            .db
            .publish_with_request(RequestUpdate {
                packet,
                records,
                caller: Some(args.class_name),
                skip_request: false,
                transaction_id: None,
                expires: 0,
            })
            .await?;
        Ok(())
    }

    /// Compose the user-visible abort text: explicit text (macro-expanded
    /// when an expander is wired), then a named lookup, then the structured
    /// error's description. Expansion failures fall back to the raw text.
    async fn compose_detail(&self, args: &AbortArgs<'_>, system_id: Option<&str>) -> String {
        if let Some(text) = &args.message_text {
            if let Some(expander) = &self.ctx.expander {
                match expander.expand(text, &self.fields).await {
                    Ok(expanded) => return expanded,
                    Err(e) => warn!(error = %e, "Macro expansion failed, using raw text"),
                }
            }
            return text.clone();
        }

        if let Some(name) = &args.message_name {
            if let Some(source) = &self.ctx.text_source {
                let lookup = source
                    .lookup(
                        name,
                        &self.fields,
                        TextLookup {
                            system_id,
                            ..Default::default()
                        },
                    )
                    .await;
                match lookup {
                    Ok(text) => {
                        if let Some(expander) = &self.ctx.expander {
                            if let Ok(expanded) = expander.expand(&text, &self.fields).await {
                                return expanded;
                            }
                        }
                        return text;
                    }
                    Err(e) => warn!(message_name = %name, error = %e, "Message lookup failed"),
                }
            }
        }

        args.sito_return
            .as_ref()
            .map(|r| r.description.clone())
            .unwrap_or_default()
    }
}
