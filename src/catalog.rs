use crate::entity::User;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Permission rule must target exactly one of channel or model")]
    InvalidRule,
    #[error("Invalid model {id}: {reason}")]
    InvalidModel { id: String, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AIModel {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub provider: String,
    /// Identifier understood by the inference provider.
    pub model_id: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub is_active: bool,
}

impl AIModel {
    /// Reject records the inference endpoint could not be called with.
    pub fn validate(&self) -> Result<(), CatalogError> {
        let invalid = |reason| {
            Err(CatalogError::InvalidModel {
                id: self.id.clone(),
                reason,
            })
        };
        if self.id.trim().is_empty() || self.model_id.trim().is_empty() {
            return invalid("id and provider model id are required");
        }
        if self.max_tokens == 0 {
            return invalid("max_tokens must be positive");
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return invalid("temperature must be a non-negative number");
        }
        Ok(())
    }
}

/// Which models a channel admits.
///
/// Persisted as a JSON array of model ids; an empty array means every active model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub enum AllowList {
    All,
    Only(BTreeSet<String>),
}

impl AllowList {
    /// Parse the stored column. Missing, empty and unparsable values all degrade to `All`.
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return AllowList::All;
        };

        match serde_json::from_str::<Vec<String>>(raw) {
            Ok(ids) => ids.into(),
            Err(e) => {
                warn!("Unparsable channel allow-list {:?}, allowing all active models: {}", raw, e);
                AllowList::All
            }
        }
    }

    pub fn permits(&self, model_id: &str) -> bool {
        match self {
            AllowList::All => true,
            AllowList::Only(ids) => ids.contains(model_id),
        }
    }

    pub fn to_json(&self) -> String {
        let ids: Vec<String> = self.clone().into();
        serde_json::to_string(&ids).unwrap_or_else(|_| "[]".to_string())
    }

    /// Ids in the list that are not among `known`.
    pub fn unknown_ids<'a>(&'a self, known: &[AIModel]) -> Vec<&'a str> {
        match self {
            AllowList::All => Vec::new(),
            AllowList::Only(ids) => ids
                .iter()
                .filter(|id| !known.iter().any(|m| &m.id == *id))
                .map(String::as_str)
                .collect(),
        }
    }
}

impl From<Vec<String>> for AllowList {
    fn from(ids: Vec<String>) -> Self {
        if ids.is_empty() {
            AllowList::All
        } else {
            AllowList::Only(ids.into_iter().collect())
        }
    }
}

impl From<AllowList> for Vec<String> {
    fn from(list: AllowList) -> Self {
        match list {
            AllowList::All => Vec::new(),
            AllowList::Only(ids) => ids.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub allowed_models: AllowList,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Effect::Allow),
            "deny" => Some(Effect::Deny),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    Channel(String),
    Model(String),
}

impl RuleTarget {
    /// Build a target from the nullable `channel_id`/`model_id` column pair.
    pub fn from_columns(
        channel_id: Option<String>,
        model_id: Option<String>,
    ) -> Result<Self, CatalogError> {
        let channel_id = channel_id.filter(|s| !s.is_empty());
        let model_id = model_id.filter(|s| !s.is_empty());
        match (channel_id, model_id) {
            (Some(c), None) => Ok(RuleTarget::Channel(c)),
            (None, Some(m)) => Ok(RuleTarget::Model(m)),
            _ => Err(CatalogError::InvalidRule),
        }
    }

    pub fn channel_id(&self) -> Option<&str> {
        match self {
            RuleTarget::Channel(id) => Some(id),
            RuleTarget::Model(_) => None,
        }
    }

    pub fn model_id(&self) -> Option<&str> {
        match self {
            RuleTarget::Model(id) => Some(id),
            RuleTarget::Channel(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub id: String,
    pub user_id: String,
    pub target: RuleTarget,
    pub effect: Effect,
    pub created_at: DateTime<Utc>,
}

/// Read access to the durable configuration records.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn list_models(&self) -> Result<Vec<AIModel>>;
    async fn list_channels(&self) -> Result<Vec<Channel>>;
    async fn find_channel(&self, channel_id: &str) -> Result<Option<Channel>>;
    async fn rules_for_user(&self, user_id: &str) -> Result<Vec<PermissionRule>>;
}

fn has_rule(rules: &[&PermissionRule], target: &RuleTarget, effect: Effect) -> bool {
    rules.iter().any(|r| r.effect == effect && &r.target == target)
}

/// Compute the models `user` may use inside `channel`.
///
/// Channel allow-list ∩ active models, widened by model-level `allow` rules and
/// narrowed by `deny` rules. Deny always wins; nothing revives an inactive model.
/// An empty result means "no available model" and must be surfaced as such.
pub fn resolve_allowed_models(
    user: &User,
    channel: &Channel,
    models: &[AIModel],
    rules: &[PermissionRule],
) -> Vec<AIModel> {
    if !user.is_active || !channel.is_active {
        return Vec::new();
    }

    let rules: Vec<&PermissionRule> = rules.iter().filter(|r| r.user_id == user.id).collect();

    if has_rule(&rules, &RuleTarget::Channel(channel.id.clone()), Effect::Deny) {
        debug!("Channel {} denied to user {}", channel.id, user.id);
        return Vec::new();
    }

    let mut allowed: Vec<AIModel> = models
        .iter()
        .filter(|m| m.is_active)
        .filter(|m| {
            let target = RuleTarget::Model(m.id.clone());
            let in_scope = channel.allowed_models.permits(&m.id)
                || has_rule(&rules, &target, Effect::Allow);
            in_scope && !has_rule(&rules, &target, Effect::Deny)
        })
        .cloned()
        .collect();

    allowed.sort_by(|a, b| a.display_name.cmp(&b.display_name));
    allowed
}

/// Resolves models and channels against the configuration store on every call.
#[derive(Clone)]
pub struct Catalog {
    source: Arc<dyn CatalogSource>,
}

impl Catalog {
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self { source }
    }

    pub async fn resolve_allowed_models(&self, user: &User, channel_id: &str) -> Result<Vec<AIModel>> {
        let Some(channel) = self.source.find_channel(channel_id).await? else {
            debug!("Channel {} not found, no models available", channel_id);
            return Ok(Vec::new());
        };
        let models = self.source.list_models().await?;
        let rules = self.source.rules_for_user(&user.id).await?;

        Ok(resolve_allowed_models(user, &channel, &models, &rules))
    }

    pub async fn can_use_model(&self, user: &User, channel_id: &str, model_id: &str) -> Result<bool> {
        let allowed = self.resolve_allowed_models(user, channel_id).await?;
        Ok(allowed.iter().any(|m| m.id == model_id))
    }

    /// Channels shown in the picker: active and not denied to the user.
    pub async fn available_channels(&self, user: &User) -> Result<Vec<Channel>> {
        if !user.is_active {
            return Ok(Vec::new());
        }
        let rules = self.source.rules_for_user(&user.id).await?;
        let rules: Vec<&PermissionRule> = rules.iter().collect();

        let mut channels: Vec<Channel> = self
            .source
            .list_channels()
            .await?
            .into_iter()
            .filter(|c| c.is_active)
            .filter(|c| !has_rule(&rules, &RuleTarget::Channel(c.id.clone()), Effect::Deny))
            .collect();

        channels.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(channels)
    }

    pub async fn find_channel(&self, channel_id: &str) -> Result<Option<Channel>> {
        self.source.find_channel(channel_id).await
    }

    /// Every configured model, active or not.
    pub async fn list_models(&self) -> Result<Vec<AIModel>> {
        self.source.list_models().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entity::{Identity, User};

    pub(crate) fn model(id: &str, active: bool) -> AIModel {
        AIModel {
            id: id.to_string(),
            name: id.to_string(),
            display_name: id.to_uppercase(),
            provider: "openai".to_string(),
            model_id: id.to_string(),
            max_tokens: 4000,
            temperature: 0.7,
            is_active: active,
        }
    }

    pub(crate) fn channel(id: &str, allowed: AllowList) -> Channel {
        Channel {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            allowed_models: allowed,
            is_active: true,
        }
    }

    pub(crate) fn user(id: &str) -> User {
        User::from_identity(
            &Identity {
                id: id.to_string(),
                email: format!("{}@example.com", id),
                display_name: None,
            },
            "admin@example.com",
        )
    }

    fn rule(user_id: &str, target: RuleTarget, effect: Effect) -> PermissionRule {
        PermissionRule {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            target,
            effect,
            created_at: Utc::now(),
        }
    }

    fn only(ids: &[&str]) -> AllowList {
        AllowList::Only(ids.iter().map(|s| s.to_string()).collect())
    }

    fn ids(models: &[AIModel]) -> Vec<&str> {
        models.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn model_settings_are_validated() {
        assert!(model("a", true).validate().is_ok());

        let mut zero_tokens = model("a", true);
        zero_tokens.max_tokens = 0;
        let mut negative = model("a", true);
        negative.temperature = -0.1;
        let mut nan = model("a", true);
        nan.temperature = f32::NAN;
        let mut blank = model("a", true);
        blank.model_id = " ".into();

        for bad in [zero_tokens, negative, nan, blank] {
            assert!(matches!(bad.validate(), Err(CatalogError::InvalidModel { .. })));
        }
    }

    #[test]
    fn empty_allow_list_returns_all_active_models() {
        let models = vec![model("a", true), model("b", true), model("c", true)];
        let ch = channel("general", AllowList::parse(Some("[]")));

        let allowed = resolve_allowed_models(&user("u"), &ch, &models, &[]);
        assert_eq!(ids(&allowed), vec!["a", "b", "c"]);
    }

    #[test]
    fn allow_list_is_intersected_with_active_models() {
        let models = vec![model("a", true), model("b", false), model("c", true)];
        let ch = channel("coding", only(&["a", "b", "gone"]));

        let allowed = resolve_allowed_models(&user("u"), &ch, &models, &[]);
        assert_eq!(ids(&allowed), vec!["a"]);
    }

    #[test]
    fn unparsable_allow_list_degrades_to_all() {
        assert_eq!(AllowList::parse(Some("not json")), AllowList::All);
        assert_eq!(AllowList::parse(Some("[1, 2]")), AllowList::All);
        assert_eq!(AllowList::parse(None), AllowList::All);
        assert_eq!(AllowList::parse(Some(r#"["a"]"#)), only(&["a"]));
    }

    #[test]
    fn model_deny_beats_conflicting_allow() {
        let models = vec![model("a", true), model("b", true)];
        let ch = channel("general", AllowList::All);
        let rules = vec![
            rule("u", RuleTarget::Model("a".into()), Effect::Allow),
            rule("u", RuleTarget::Model("a".into()), Effect::Deny),
        ];

        let allowed = resolve_allowed_models(&user("u"), &ch, &models, &rules);
        assert_eq!(ids(&allowed), vec!["b"]);
    }

    #[test]
    fn model_allow_adds_back_out_of_scope_model_but_not_inactive_one() {
        let models = vec![model("a", true), model("b", true), model("c", false)];
        let ch = channel("coding", only(&["a"]));
        let rules = vec![
            rule("u", RuleTarget::Model("b".into()), Effect::Allow),
            rule("u", RuleTarget::Model("c".into()), Effect::Allow),
        ];

        let allowed = resolve_allowed_models(&user("u"), &ch, &models, &rules);
        assert_eq!(ids(&allowed), vec!["a", "b"]);
    }

    #[test]
    fn channel_deny_empties_result_even_with_model_allow() {
        let models = vec![model("a", true)];
        let ch = channel("general", AllowList::All);
        let rules = vec![
            rule("u", RuleTarget::Channel("general".into()), Effect::Deny),
            rule("u", RuleTarget::Model("a".into()), Effect::Allow),
        ];

        assert!(resolve_allowed_models(&user("u"), &ch, &models, &rules).is_empty());
    }

    #[test]
    fn rules_for_other_users_are_ignored() {
        let models = vec![model("a", true)];
        let ch = channel("general", AllowList::All);
        let rules = vec![rule("someone-else", RuleTarget::Model("a".into()), Effect::Deny)];

        assert_eq!(ids(&resolve_allowed_models(&user("u"), &ch, &models, &rules)), vec!["a"]);
    }

    #[test]
    fn inactive_user_or_channel_gets_nothing() {
        let models = vec![model("a", true)];
        let mut ch = channel("general", AllowList::All);
        let mut u = user("u");
        u.is_active = false;
        assert!(resolve_allowed_models(&u, &ch, &models, &[]).is_empty());

        ch.is_active = false;
        assert!(resolve_allowed_models(&user("u"), &ch, &models, &[]).is_empty());
    }

    #[test]
    fn rule_target_requires_exactly_one_dimension() {
        assert_eq!(
            RuleTarget::from_columns(Some("general".into()), None),
            Ok(RuleTarget::Channel("general".into()))
        );
        assert_eq!(
            RuleTarget::from_columns(None, Some("gpt-4o".into())),
            Ok(RuleTarget::Model("gpt-4o".into()))
        );
        assert_eq!(
            RuleTarget::from_columns(Some("general".into()), Some("gpt-4o".into())),
            Err(CatalogError::InvalidRule)
        );
        assert_eq!(RuleTarget::from_columns(None, Some(String::new())), Err(CatalogError::InvalidRule));
    }

    #[test]
    fn allow_list_reports_unknown_ids() {
        let known = vec![model("a", true)];
        let list = only(&["a", "zombie"]);
        assert_eq!(list.unknown_ids(&known), vec!["zombie"]);
        assert_eq!(list.to_json(), r#"["a","zombie"]"#);
    }
}
