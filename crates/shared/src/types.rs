//! Common types used across CoachPay

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime};

use crate::error::PlatformError;

// =============================================================================
// Enums
// =============================================================================

/// Role of a platform user, as reported by the profile service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Coach,
    Trainee,
    Admin,
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coach => write!(f, "coach"),
            Self::Trainee => write!(f, "trainee"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "coach" => Ok(Self::Coach),
            "trainee" | "client" => Ok(Self::Trainee),
            "admin" => Ok(Self::Admin),
            _ => Err(PlatformError::Validation(format!("Invalid user role: {}", s))),
        }
    }
}

/// Which subscriber population a subscription or product belongs to.
///
/// Coaches pay the platform; clients (trainees) pay a coach, and the platform
/// keeps a commission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriberKind {
    Coach,
    Client,
}

impl SubscriberKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coach => "coach",
            Self::Client => "client",
        }
    }

    /// Role the subscribing user must hold
    pub fn required_subscriber_role(&self) -> UserRole {
        match self {
            Self::Coach => UserRole::Coach,
            Self::Client => UserRole::Trainee,
        }
    }
}

impl std::fmt::Display for SubscriberKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriberKind {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "coach" => Ok(Self::Coach),
            "client" => Ok(Self::Client),
            _ => Err(PlatformError::Validation(format!(
                "Invalid subscriber kind: {}",
                s
            ))),
        }
    }
}

/// Subscription plan.
///
/// Coach plans: Starter → Professional → Elite (+ Custom).
/// Client plans: Basic → Standard → Premium (+ Custom).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Starter,
    Professional,
    Elite,
    Basic,
    Standard,
    Premium,
    Custom,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starter => "starter",
            Self::Professional => "professional",
            Self::Elite => "elite",
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::Premium => "premium",
            Self::Custom => "custom",
        }
    }

    /// Whether this plan belongs to the given subscriber population's vocabulary
    pub fn is_offered_to(&self, kind: SubscriberKind) -> bool {
        match kind {
            SubscriberKind::Coach => matches!(
                self,
                Self::Starter | Self::Professional | Self::Elite | Self::Custom
            ),
            SubscriberKind::Client => matches!(
                self,
                Self::Basic | Self::Standard | Self::Premium | Self::Custom
            ),
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Plan {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starter" => Ok(Self::Starter),
            "professional" | "pro" => Ok(Self::Professional),
            "elite" => Ok(Self::Elite),
            "basic" => Ok(Self::Basic),
            "standard" => Ok(Self::Standard),
            "premium" => Ok(Self::Premium),
            "custom" => Ok(Self::Custom),
            _ => Err(PlatformError::Validation(format!("Invalid plan: {}", s))),
        }
    }
}

/// Recurrence unit at which a subscription is charged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Default for BillingCycle {
    fn default() -> Self {
        Self::Monthly
    }
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
        }
    }

    /// Advance an instant by one cycle.
    ///
    /// Month-based cycles keep the day of month and clamp to the last day of
    /// shorter months (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(&self, from: OffsetDateTime) -> Result<OffsetDateTime, PlatformError> {
        match self {
            Self::Weekly => from
                .checked_add(Duration::weeks(1))
                .ok_or_else(|| PlatformError::DateOutOfRange(from.to_string())),
            Self::Monthly => add_months(from, 1),
            Self::Quarterly => add_months(from, 3),
            Self::Yearly => add_months(from, 12),
        }
    }
}

fn add_months(from: OffsetDateTime, months: u32) -> Result<OffsetDateTime, PlatformError> {
    let total = i64::from(from.year()) * 12 + i64::from(u8::from(from.month()) - 1) + i64::from(months);
    let year = i32::try_from(total.div_euclid(12))
        .map_err(|_| PlatformError::DateOutOfRange(from.to_string()))?;
    let month = Month::try_from((total.rem_euclid(12) + 1) as u8)
        .map_err(|e| PlatformError::DateOutOfRange(e.to_string()))?;
    let day = from.day().min(time::util::days_in_year_month(year, month));
    let date = Date::from_calendar_date(year, month, day)
        .map_err(|e| PlatformError::DateOutOfRange(e.to_string()))?;
    Ok(from.replace_date(date))
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BillingCycle {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "yearly" | "annual" => Ok(Self::Yearly),
            _ => Err(PlatformError::Validation(format!(
                "Invalid billing cycle: {}",
                s
            ))),
        }
    }
}

/// Subscription lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Pending,
    Active,
    PastDue,
    Paused,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    /// Statuses that still count as "the" subscription for a subscriber
    pub const NON_TERMINAL: [SubscriptionStatus; 5] = [
        Self::Trial,
        Self::Pending,
        Self::Active,
        Self::PastDue,
        Self::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trial" => Ok(Self::Trial),
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            _ => Err(PlatformError::Validation(format!(
                "Invalid subscription status: {}",
                s
            ))),
        }
    }
}

/// Payment rail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Apple in-app purchase (store receipt)
    AppleIap,
    /// Google Play billing (purchase token)
    GooglePlay,
    /// Card processor payment intent
    Card,
    /// PayPal wallet order
    Paypal,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 4] = [Self::AppleIap, Self::GooglePlay, Self::Card, Self::Paypal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppleIap => "apple_iap",
            Self::GooglePlay => "google_play",
            Self::Card => "card",
            Self::Paypal => "paypal",
        }
    }

    /// App-store rails take a flat percentage and manage renewals themselves
    pub fn is_app_store(&self) -> bool {
        matches!(self, Self::AppleIap | Self::GooglePlay)
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PaymentMethod {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "apple_iap" | "apple" => Ok(Self::AppleIap),
            "google_play" | "google" => Ok(Self::GooglePlay),
            "card" | "stripe" => Ok(Self::Card),
            "paypal" => Ok(Self::Paypal),
            _ => Err(PlatformError::Validation(format!(
                "Invalid payment method: {}",
                s
            ))),
        }
    }
}

/// What a payment is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Subscription,
    OneTime,
    Payout,
    Refund,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::OneTime => "one_time",
            Self::Payout => "payout",
            Self::Refund => "refund",
        }
    }
}

impl std::fmt::Display for PaymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PaymentType {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "subscription" => Ok(Self::Subscription),
            "one_time" => Ok(Self::OneTime),
            "payout" => Ok(Self::Payout),
            "refund" => Ok(Self::Refund),
            _ => Err(PlatformError::Validation(format!(
                "Invalid payment type: {}",
                s
            ))),
        }
    }
}

/// Payment ledger status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
            Self::Expired => "expired",
        }
    }

    /// The ledger transition table. Anything not listed here is illegal.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Cancelled)
                | (Self::Pending, Self::Expired)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
                | (Self::Completed, Self::Refunded)
        )
    }

    /// Statuses from which `next` may be entered
    pub fn sources_of(next: PaymentStatus) -> Vec<PaymentStatus> {
        [
            Self::Pending,
            Self::Processing,
            Self::Completed,
            Self::Failed,
            Self::Cancelled,
            Self::Refunded,
            Self::Expired,
        ]
        .into_iter()
        .filter(|s| s.can_transition_to(next))
        .collect()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Refunded | Self::Expired
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "refunded" => Ok(Self::Refunded),
            "expired" => Ok(Self::Expired),
            _ => Err(PlatformError::Validation(format!(
                "Invalid payment status: {}",
                s
            ))),
        }
    }
}

/// Who ended a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CancelledBy {
    User,
    Coach,
    Admin,
    System,
}

impl std::fmt::Display for CancelledBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Coach => write!(f, "coach"),
            Self::Admin => write!(f, "admin"),
            Self::System => write!(f, "system"),
        }
    }
}

// =============================================================================
// Pagination
// =============================================================================

/// Page request (1-based page, bounded page size)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    20
}

/// Largest page a caller may request
pub const MAX_PAGE_SIZE: i64 = 100;

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
        }
    }
}

impl Pagination {
    pub fn new(page: i64, limit: i64) -> Self {
        Self { page, limit }.normalized()
    }

    /// Clamp page to >= 1 and limit to 1..=MAX_PAGE_SIZE
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            limit: self.limit.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> i64 {
        let p = self.normalized();
        (p.page - 1) * p.limit
    }
}

/// Paginated response wrapper
#[derive(Debug, Clone, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, total: i64, page: i64, per_page: i64) -> Self {
        let total_pages = if per_page > 0 {
            (total + per_page - 1) / per_page
        } else {
            0
        };
        Self {
            data,
            total,
            page,
            per_page,
            total_pages,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> PaginatedResponse<U> {
        PaginatedResponse {
            data: self.data.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            per_page: self.per_page,
            total_pages: self.total_pages,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
