//! Eligibility filter
//!
//! Streams the recipients of a campaign run in creation or seeded random
//! order. Attribute filters, deduplication and cooldown are evaluated one
//! page at a time as the stream is pulled, so sends made earlier in the run
//! are visible to later pages.

use crate::settings::EffectivePolicy;
use chrono::{DateTime, Utc};
use courier_common::types::{CampaignId, Channel, ClientId, FilterConfig, GroupId, MessengerTarget};
use courier_common::Result;
use courier_storage::{Campaign, Client, ClientCursor, SentQuery, Stores};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

/// One delivery of a client's plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub channel: Channel,
    pub phone: String,
}

/// An admitted recipient and its ordered delivery plan
#[derive(Debug, Clone)]
pub struct Candidate {
    pub client: Client,
    pub steps: Vec<PlannedStep>,
}

/// Delivery plan for a client: one step per valid channel, in target order
pub fn plan_for(client: &Client, target: &MessengerTarget) -> Vec<PlannedStep> {
    target
        .channels()
        .iter()
        .filter(|channel| client.channel_status(**channel).is_sendable())
        .map(|channel| PlannedStep {
            channel: *channel,
            phone: client.phone.clone(),
        })
        .collect()
}

enum Order {
    Creation {
        cursor: Option<ClientCursor>,
        done: bool,
    },
    Random {
        seed: i64,
        ids: Option<VecDeque<ClientId>>,
    },
}

/// Restartable, lazily evaluated candidate sequence for one run
pub struct CandidateStream {
    campaign_id: CampaignId,
    run: i32,
    group_id: GroupId,
    target: MessengerTarget,
    filter: FilterConfig,
    dedup: Option<(chrono::Duration, Vec<CampaignId>)>,
    cooldown: Option<chrono::Duration>,
    order: Order,
    batch_size: u32,
    buffer: VecDeque<Client>,
    admitted: Option<HashSet<ClientId>>,
    exhausted: bool,
}

impl CandidateStream {
    pub fn new(campaign: &Campaign, policy: &EffectivePolicy, batch_size: u32) -> Self {
        let order = if campaign.filter.random_order {
            Order::Random {
                seed: campaign.run_seed,
                ids: None,
            }
        } else {
            Order::Creation {
                cursor: None,
                done: false,
            }
        };

        Self {
            campaign_id: campaign.id,
            run: campaign.run,
            group_id: campaign.group_id,
            target: campaign.target,
            filter: campaign.filter.clone(),
            dedup: policy
                .dedup
                .as_ref()
                .map(|d| (d.period, d.campaign_ids.clone())),
            cooldown: policy.cooldown,
            order,
            batch_size: batch_size.max(1),
            buffer: VecDeque::new(),
            admitted: None,
            exhausted: false,
        }
    }

    /// Pick up re-resolved dedup and cooldown rules
    pub fn update_policy(&mut self, policy: &EffectivePolicy) {
        self.dedup = policy
            .dedup
            .as_ref()
            .map(|d| (d.period, d.campaign_ids.clone()));
        self.cooldown = policy.cooldown;
    }

    /// Distinct clients admitted into the run so far
    pub fn admitted_count(&self) -> usize {
        self.admitted.as_ref().map_or(0, HashSet::len)
    }

    /// Next eligible candidate; `None` once the group or contact limit is
    /// exhausted. The returned client counts as admitted.
    pub async fn next(&mut self, stores: &Stores, now: DateTime<Utc>) -> Result<Option<Candidate>> {
        if self.admitted.is_none() {
            let admitted = stores
                .messages
                .admitted_clients(self.campaign_id, self.run)
                .await?;
            self.admitted = Some(admitted.into_iter().collect());
        }

        loop {
            if self.limit_reached() {
                self.exhausted = true;
            }
            if self.exhausted {
                return Ok(None);
            }

            if let Some(client) = self.buffer.pop_front() {
                let steps = plan_for(&client, &self.target);
                if steps.is_empty() {
                    continue;
                }
                if let Some(admitted) = self.admitted.as_mut() {
                    admitted.insert(client.id);
                }
                return Ok(Some(Candidate { client, steps }));
            }

            let page = self.fetch_page(stores).await?;
            if page.is_empty() {
                if self.source_done() {
                    self.exhausted = true;
                }
                continue;
            }
            self.admit_page(stores, page, now).await?;
        }
    }

    fn limit_reached(&self) -> bool {
        match self.filter.contact_limit {
            Some(limit) => self.admitted_count() >= limit as usize,
            None => false,
        }
    }

    fn source_done(&self) -> bool {
        match &self.order {
            Order::Creation { done, .. } => *done,
            Order::Random { ids, .. } => ids.as_ref().map_or(false, VecDeque::is_empty),
        }
    }

    async fn fetch_page(&mut self, stores: &Stores) -> Result<Vec<Client>> {
        let batch = self.batch_size;
        match &mut self.order {
            Order::Creation { cursor, done } => {
                if *done {
                    return Ok(Vec::new());
                }
                let page = stores.clients.page(self.group_id, *cursor, batch).await?;
                if (page.len() as u32) < batch {
                    *done = true;
                }
                if let Some(last) = page.last() {
                    *cursor = Some(ClientCursor::from(last));
                }
                Ok(page)
            }
            Order::Random { seed, ids } => {
                if ids.is_none() {
                    let mut all = stores.clients.ids(self.group_id).await?;
                    let mut rng = StdRng::seed_from_u64(*seed as u64);
                    all.shuffle(&mut rng);
                    *ids = Some(all.into());
                }
                let Some(queue) = ids.as_mut() else {
                    return Ok(Vec::new());
                };
                let take = queue.len().min(batch as usize);
                let chunk: Vec<ClientId> = queue.drain(..take).collect();
                if chunk.is_empty() {
                    return Ok(Vec::new());
                }
                stores.clients.get_many(&chunk).await
            }
        }
    }

    /// Apply the filter rules in order to one page and buffer the survivors
    async fn admit_page(
        &mut self,
        stores: &Stores,
        page: Vec<Client>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let admitted = self.admitted.as_ref();
        let mut survivors: Vec<Client> = page
            .into_iter()
            .filter(|c| admitted.map_or(true, |a| !a.contains(&c.id)))
            .filter(|c| c.matches(&self.filter))
            .collect();

        if let Some((period, campaign_ids)) = &self.dedup {
            let hits = stores
                .messages
                .sent_clients(SentQuery {
                    client_ids: survivors.iter().map(|c| c.id).collect(),
                    campaign_ids: Some(campaign_ids.clone()),
                    exclude_run: Some((self.campaign_id, self.run)),
                    since: now - *period,
                })
                .await?;
            if !hits.is_empty() {
                debug!(campaign_id = %self.campaign_id, excluded = hits.len(), "Deduplicated clients");
                survivors.retain(|c| !hits.contains(&c.id));
            }
        }

        if let Some(cooldown) = self.cooldown {
            let hits = stores
                .messages
                .sent_clients(SentQuery {
                    client_ids: survivors.iter().map(|c| c.id).collect(),
                    campaign_ids: None,
                    exclude_run: Some((self.campaign_id, self.run)),
                    since: now - cooldown,
                })
                .await?;
            if !hits.is_empty() {
                debug!(campaign_id = %self.campaign_id, excluded = hits.len(), "Clients in cooldown");
                survivors.retain(|c| !hits.contains(&c.id));
            }
        }

        self.buffer.extend(survivors);
        Ok(())
    }
}

/// Estimated recipients of a run: group members passing the attribute
/// filters with at least one valid channel, capped by the contact limit
pub async fn estimate_total(stores: &Stores, campaign: &Campaign, batch_size: u32) -> Result<i64> {
    let batch = batch_size.max(1);
    let mut cursor = None;
    let mut total: i64 = 0;
    loop {
        let page = stores.clients.page(campaign.group_id, cursor, batch).await?;
        total += page
            .iter()
            .filter(|c| c.matches(&campaign.filter))
            .filter(|c| !plan_for(c, &campaign.target).is_empty())
            .count() as i64;
        if (page.len() as u32) < batch {
            break;
        }
        cursor = page.last().map(ClientCursor::from);
    }
    if let Some(limit) = campaign.filter.contact_limit {
        total = total.min(i64::from(limit));
    }
    Ok(total)
}
