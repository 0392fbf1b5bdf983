use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use ulid::Ulid;

/// Closed error taxonomy shared by every layer of the stocktake service.
///
/// Validation failures always carry the complete field-error list so the
/// boundary can render every problem in one round trip.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StocktakeError {
    #[error("validation failed: {} error(s)", .0.len())]
    Validation(Vec<FieldError>),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authentication required")]
    AuthRequired,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubmissionId(pub Ulid);

impl SubmissionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SubmissionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of one specific submission version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Active,
    Superseded,
    Archived,
}

impl SubmissionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "superseded" => Some(Self::Superseded),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StudyType {
    ExAnteImpact,
    ForesightFutures,
    ProcessPerformance,
    CausalImpact,
    AdoptionDiffusion,
    ScalingReadiness,
    ScalingPolicyTracing,
    InstitutionalPolicyChange,
    SynthesisStrategicLearning,
    MeliafMethod,
}

impl StudyType {
    pub const ALLOWED: &'static [&'static str] = &[
        "adoption_diffusion",
        "causal_impact",
        "ex_ante_impact",
        "foresight_futures",
        "institutional_policy_change",
        "meliaf_method",
        "process_performance",
        "scaling_policy_tracing",
        "scaling_readiness",
        "synthesis_strategic_learning",
    ];

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ex_ante_impact" => Some(Self::ExAnteImpact),
            "foresight_futures" => Some(Self::ForesightFutures),
            "process_performance" => Some(Self::ProcessPerformance),
            "causal_impact" => Some(Self::CausalImpact),
            "adoption_diffusion" => Some(Self::AdoptionDiffusion),
            "scaling_readiness" => Some(Self::ScalingReadiness),
            "scaling_policy_tracing" => Some(Self::ScalingPolicyTracing),
            "institutional_policy_change" => Some(Self::InstitutionalPolicyChange),
            "synthesis_strategic_learning" => Some(Self::SynthesisStrategicLearning),
            "meliaf_method" => Some(Self::MeliafMethod),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Timing {
    T0ExAnte,
    T1During,
    T2Endline,
    T3ExPost,
}

impl Timing {
    pub const ALLOWED: &'static [&'static str] =
        &["t0_ex_ante", "t1_during", "t2_endline", "t3_ex_post"];

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "t0_ex_ante" => Some(Self::T0ExAnte),
            "t1_during" => Some(Self::T1During),
            "t2_endline" => Some(Self::T2Endline),
            "t3_ex_post" => Some(Self::T3ExPost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticalScope {
    InnovationTechnology,
    ProjectIntervention,
    ProgramAccelerator,
    PortfolioSystem,
}

impl AnalyticalScope {
    pub const ALLOWED: &'static [&'static str] = &[
        "innovation_technology",
        "portfolio_system",
        "program_accelerator",
        "project_intervention",
    ];

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "innovation_technology" => Some(Self::InnovationTechnology),
            "project_intervention" => Some(Self::ProjectIntervention),
            "program_accelerator" => Some(Self::ProgramAccelerator),
            "portfolio_system" => Some(Self::PortfolioSystem),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GeographicScope {
    Global,
    Regional,
    National,
    SubNational,
    SiteSpecific,
}

impl GeographicScope {
    pub const ALLOWED: &'static [&'static str] =
        &["global", "national", "regional", "site_specific", "sub_national"];

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "global" => Some(Self::Global),
            "regional" => Some(Self::Regional),
            "national" => Some(Self::National),
            "sub_national" => Some(Self::SubNational),
            "site_specific" => Some(Self::SiteSpecific),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResultLevel {
    Output,
    Outcome,
    Impact,
}

impl ResultLevel {
    pub const ALLOWED: &'static [&'static str] = &["impact", "outcome", "output"];

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "output" => Some(Self::Output),
            "outcome" => Some(Self::Outcome),
            "impact" => Some(Self::Impact),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CausalityMode {
    C0Descriptive,
    C1Contribution,
    C2Causal,
}

impl CausalityMode {
    pub const ALLOWED: &'static [&'static str] =
        &["c0_descriptive", "c1_contribution", "c2_causal"];

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "c0_descriptive" => Some(Self::C0Descriptive),
            "c1_contribution" => Some(Self::C1Contribution),
            "c2_causal" => Some(Self::C2Causal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MethodClass {
    Qualitative,
    Quantitative,
    Mixed,
    ExperimentalQuasi,
    ModelingSimulation,
    Observational,
    EvidenceSynthesis,
    Participatory,
}

impl MethodClass {
    pub const ALLOWED: &'static [&'static str] = &[
        "evidence_synthesis",
        "experimental_quasi",
        "mixed",
        "modeling_simulation",
        "observational",
        "participatory",
        "qualitative",
        "quantitative",
    ];

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "qualitative" => Some(Self::Qualitative),
            "quantitative" => Some(Self::Quantitative),
            "mixed" => Some(Self::Mixed),
            "experimental_quasi" => Some(Self::ExperimentalQuasi),
            "modeling_simulation" => Some(Self::ModelingSimulation),
            "observational" => Some(Self::Observational),
            "evidence_synthesis" => Some(Self::EvidenceSynthesis),
            "participatory" => Some(Self::Participatory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Planned,
    Ongoing,
    Complete,
}

impl ProgressStatus {
    pub const ALLOWED: &'static [&'static str] = &["complete", "ongoing", "planned"];

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "planned" => Some(Self::Planned),
            "ongoing" => Some(Self::Ongoing),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FundedStatus {
    Yes,
    No,
    Partial,
}

impl FundedStatus {
    pub const ALLOWED: &'static [&'static str] = &["no", "partial", "yes"];

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "yes" => Some(Self::Yes),
            "no" => Some(Self::No),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum YesNoNa {
    Yes,
    No,
    Na,
}

impl YesNoNa {
    pub const ALLOWED: &'static [&'static str] = &["na", "no", "yes"];

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "yes" => Some(Self::Yes),
            "no" => Some(Self::No),
            "na" => Some(Self::Na),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryUser {
    Iaes,
    Program,
    Donor,
    Board,
    Comms,
    PolicyMakers,
    Researchers,
    Other,
}

impl PrimaryUser {
    pub const ALLOWED: &'static [&'static str] = &[
        "board",
        "comms",
        "donor",
        "iaes",
        "other",
        "policy_makers",
        "program",
        "researchers",
    ];

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "iaes" => Some(Self::Iaes),
            "program" => Some(Self::Program),
            "donor" => Some(Self::Donor),
            "board" => Some(Self::Board),
            "comms" => Some(Self::Comms),
            "policy_makers" => Some(Self::PolicyMakers),
            "researchers" => Some(Self::Researchers),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum YesNo {
    Yes,
    No,
}

/// A yes/no answer with a link that becomes mandatory when the answer is yes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct YesNoLink {
    pub answer: YesNo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

pub const MAX_STUDY_ID: usize = 50;
pub const MAX_STUDY_TITLE: usize = 500;
pub const MAX_LEAD_CENTER: usize = 200;
pub const MAX_CONTACT_NAME: usize = 100;
pub const MAX_PRIMARY_INDICATOR: usize = 200;
pub const MAX_RESEARCH_QUESTIONS: usize = 2000;
pub const MAX_UNIT_OF_ANALYSIS: usize = 200;
pub const MAX_TREATMENT_INTERVENTION: usize = 500;
pub const MAX_STUDY_INDICATORS: usize = 2000;
pub const MAX_FUNDING_SOURCE: usize = 200;
pub const MAX_COMMISSIONING_SOURCE: usize = 200;

/// Canonical survey payload. Unknown input fields are dropped; there is no
/// pass-through of unvalidated data into persisted versions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalSubmission {
    pub study_id: String,
    pub study_title: String,
    pub lead_center: String,
    pub contact_name: String,
    pub contact_email: String,
    pub other_centers: Vec<String>,
    pub study_type: StudyType,
    pub timing: Timing,
    pub analytical_scope: AnalyticalScope,
    pub geographic_scope: GeographicScope,
    pub result_level: ResultLevel,
    pub causality_mode: CausalityMode,
    pub method_class: MethodClass,
    pub primary_indicator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_research_questions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_analysis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatment_intervention: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_calculation: Option<YesNoNa>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_collection_methods: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub study_indicators: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_analysis_plan: Option<YesNoLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_collection_rounds: Option<u64>,
    pub start_date: String,
    pub expected_end_date: String,
    pub data_collection_status: ProgressStatus,
    pub analysis_status: ProgressStatus,
    pub funded: FundedStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding_source: Option<String>,
    #[serde(rename = "totalCostUSD", default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    pub proposal_available: YesNoLink,
    pub manuscript_developed: YesNoLink,
    pub policy_brief_developed: YesNoLink,
    pub related_to_past_study: YesNoLink,
    pub intended_primary_user: Vec<PrimaryUser>,
    pub commissioning_source: String,
}

/// One persisted version of a submission. Immutable once written except for
/// `status` and `updated_at`, which change exactly once per transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRecord {
    pub submission_id: SubmissionId,
    pub version: u32,
    pub status: SubmissionStatus,
    pub user_id: String,
    pub modified_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(flatten)]
    pub payload: CanonicalSubmission,
}

impl SubmissionRecord {
    /// Build version 1 of a brand-new submission, owned by its creator.
    #[must_use]
    pub fn first_version(
        payload: CanonicalSubmission,
        user_id: &str,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            submission_id: SubmissionId::new(),
            version: 1,
            status: SubmissionStatus::Active,
            user_id: user_id.to_string(),
            modified_by: user_id.to_string(),
            created_at: now,
            updated_at: now,
            payload,
        }
    }

    /// Derive the successor version: number bumped, new payload fully
    /// replacing the old one, creator preserved.
    #[must_use]
    pub fn next_version(
        &self,
        payload: CanonicalSubmission,
        modified_by: &str,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            submission_id: self.submission_id,
            version: self.version + 1,
            status: SubmissionStatus::Active,
            user_id: self.user_id.clone(),
            modified_by: modified_by.to_string(),
            created_at: now,
            updated_at: now,
            payload,
        }
    }
}

/// Denormalized identity cache entry, created once per user and never
/// overwritten (first-write-wins).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: String,
    pub email: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

// --- Identity resolution ---

/// Verified claims handed over by the upstream authenticator. This crate
/// never verifies tokens itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeployEnv {
    Dev,
    Test,
    Staging,
    Prod,
}

impl DeployEnv {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Staging => "staging",
            Self::Prod => "prod",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dev" => Some(Self::Dev),
            "test" => Some(Self::Test),
            "staging" => Some(Self::Staging),
            "prod" => Some(Self::Prod),
            _ => None,
        }
    }
}

#[must_use]
pub fn dev_identity() -> Identity {
    Identity { user_id: "dev-user-001".to_string(), email: "developer@cgiar.org".to_string() }
}

/// Map inbound claims to a caller identity.
///
/// Missing claims fall back to the fixed development identity in `dev`/`test`
/// deployments; in `staging`/`prod` they are an authentication failure.
///
/// # Errors
/// Returns [`StocktakeError::AuthRequired`] when claims are absent in a
/// production-grade deployment.
pub fn resolve_identity(
    claims: Option<&Claims>,
    env: DeployEnv,
) -> Result<Identity, StocktakeError> {
    match claims {
        Some(claims) => Ok(Identity {
            user_id: claims.sub.clone(),
            email: claims.email.clone().unwrap_or_default(),
        }),
        None => match env {
            DeployEnv::Dev | DeployEnv::Test => Ok(dev_identity()),
            DeployEnv::Staging | DeployEnv::Prod => Err(StocktakeError::AuthRequired),
        },
    }
}

/// Pre-signup domain gate: an empty allow-list admits every domain.
#[must_use]
pub fn email_domain_allowed(email: &str, allowed_domains: &[String]) -> bool {
    if allowed_domains.is_empty() {
        return true;
    }
    let domain = match email.rsplit_once('@') {
        Some((_, domain)) => domain.to_ascii_lowercase(),
        None => String::new(),
    };
    allowed_domains.iter().any(|allowed| allowed.eq_ignore_ascii_case(&domain))
}

// --- Attachment key naming ---

pub const ATTACHMENT_TOKEN_LEN: usize = 8;

/// Replace path separators so a display name can never escape its prefix.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

/// Shared storage prefix for every attachment of one submission, seeded by
/// the first version's creation date.
#[must_use]
pub fn attachment_prefix(created_at: OffsetDateTime, submission_id: SubmissionId) -> String {
    let date = created_at.date();
    format!(
        "{:04}-{:02}-{:02}_{submission_id}/files/",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

#[must_use]
pub fn attachment_key(prefix: &str, token: &str, display_name: &str) -> String {
    format!("{prefix}{token}_{}", sanitize_file_name(display_name))
}

/// Recover the display name from a storage key. Keys without an underscore
/// after the prefix are returned whole, which keeps legacy keys listable.
#[must_use]
pub fn display_name_from_key<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    let remainder = key.strip_prefix(prefix)?;
    Some(remainder.split_once('_').map_or(remainder, |(_, name)| name))
}

// --- Validation engine ---

/// Validate a decoded JSON payload against the canonical submission schema.
///
/// Pure and total: every rule is evaluated and violations accumulate in rule
/// declaration order, never short-circuiting on the first failure.
///
/// # Errors
/// Returns the full ordered list of [`FieldError`]s when any rule fails.
pub fn validate_submission(
    data: &Map<String, Value>,
) -> Result<CanonicalSubmission, Vec<FieldError>> {
    let mut errors: Vec<FieldError> = Vec::new();

    // Section A: basic information
    let study_id = required_string(data, "studyId", MAX_STUDY_ID, &mut errors);
    let study_title = required_string(data, "studyTitle", MAX_STUDY_TITLE, &mut errors);
    let lead_center = required_string(data, "leadCenter", MAX_LEAD_CENTER, &mut errors);
    let contact_name = required_string(data, "contactName", MAX_CONTACT_NAME, &mut errors);
    let contact_email = required_email(data, "contactEmail", &mut errors);
    let other_centers = required_string_array(data, "otherCenters", 1, &mut errors);

    // Section B: study classification
    let study_type =
        required_enum(data, "studyType", StudyType::parse, StudyType::ALLOWED, &mut errors);
    let timing = required_enum(data, "timing", Timing::parse, Timing::ALLOWED, &mut errors);
    let analytical_scope = required_enum(
        data,
        "analyticalScope",
        AnalyticalScope::parse,
        AnalyticalScope::ALLOWED,
        &mut errors,
    );
    let geographic_scope = required_enum(
        data,
        "geographicScope",
        GeographicScope::parse,
        GeographicScope::ALLOWED,
        &mut errors,
    );
    let result_level =
        required_enum(data, "resultLevel", ResultLevel::parse, ResultLevel::ALLOWED, &mut errors);
    let causality_mode = required_enum(
        data,
        "causalityMode",
        CausalityMode::parse,
        CausalityMode::ALLOWED,
        &mut errors,
    );
    let method_class =
        required_enum(data, "methodClass", MethodClass::parse, MethodClass::ALLOWED, &mut errors);
    let primary_indicator =
        required_string(data, "primaryIndicator", MAX_PRIMARY_INDICATOR, &mut errors);

    // Section C: research details (types and lengths checked when present)
    let key_research_questions =
        optional_string(data, "keyResearchQuestions", MAX_RESEARCH_QUESTIONS, &mut errors);
    let unit_of_analysis =
        optional_string(data, "unitOfAnalysis", MAX_UNIT_OF_ANALYSIS, &mut errors);
    let treatment_intervention =
        optional_string(data, "treatmentIntervention", MAX_TREATMENT_INTERVENTION, &mut errors);
    let sample_size = optional_positive_int(data, "sampleSize", &mut errors);
    let power_calculation =
        optional_enum(data, "powerCalculation", YesNoNa::parse, YesNoNa::ALLOWED, &mut errors);
    let data_collection_methods = optional_string_array(data, "dataCollectionMethods", &mut errors);
    let study_indicators =
        optional_string(data, "studyIndicators", MAX_STUDY_INDICATORS, &mut errors);
    let pre_analysis_plan = optional_yes_no_link(data, "preAnalysisPlan", &mut errors);
    let data_collection_rounds = optional_positive_int(data, "dataCollectionRounds", &mut errors);

    // Section D: timeline and status
    let start_date = required_date(data, "startDate", &mut errors);
    let expected_end_date = required_date(data, "expectedEndDate", &mut errors);
    let data_collection_status = required_enum(
        data,
        "dataCollectionStatus",
        ProgressStatus::parse,
        ProgressStatus::ALLOWED,
        &mut errors,
    );
    let analysis_status = required_enum(
        data,
        "analysisStatus",
        ProgressStatus::parse,
        ProgressStatus::ALLOWED,
        &mut errors,
    );
    // ISO dates compare correctly as strings.
    if let (Some(Value::String(start)), Some(Value::String(end))) =
        (data.get("startDate"), data.get("expectedEndDate"))
    {
        if !start.is_empty() && !end.is_empty() && end < start {
            errors.push(FieldError::new(
                "expectedEndDate",
                "End date must be on or after start date",
            ));
        }
    }

    // Section E: funding and resources
    let funded =
        required_enum(data, "funded", FundedStatus::parse, FundedStatus::ALLOWED, &mut errors);
    if matches!(funded, Some(FundedStatus::Yes | FundedStatus::Partial)) {
        let missing = match data.get("fundingSource") {
            Some(Value::String(source)) => source.trim().is_empty(),
            Some(Value::Null) | None => true,
            Some(_) => false,
        };
        if missing {
            errors.push(FieldError::new(
                "fundingSource",
                "Required when funded is yes or partial",
            ));
        }
    }
    let funding_source = optional_string(data, "fundingSource", MAX_FUNDING_SOURCE, &mut errors);
    let total_cost_usd = optional_positive_number(data, "totalCostUSD", &mut errors);
    let proposal_available = required_yes_no_link(data, "proposalAvailable", &mut errors);

    // Section F: outputs and users
    let manuscript_developed = required_yes_no_link(data, "manuscriptDeveloped", &mut errors);
    let policy_brief_developed = required_yes_no_link(data, "policyBriefDeveloped", &mut errors);
    let related_to_past_study = required_yes_no_link(data, "relatedToPastStudy", &mut errors);
    let intended_primary_user =
        required_enum_array(data, "intendedPrimaryUser", PrimaryUser::parse, 1, &mut errors);
    let commissioning_source =
        required_string(data, "commissioningSource", MAX_COMMISSIONING_SOURCE, &mut errors);

    if !errors.is_empty() {
        return Err(errors);
    }

    let assembled = (|| {
        Some(CanonicalSubmission {
            study_id: study_id?,
            study_title: study_title?,
            lead_center: lead_center?,
            contact_name: contact_name?,
            contact_email: contact_email?,
            other_centers: other_centers?,
            study_type: study_type?,
            timing: timing?,
            analytical_scope: analytical_scope?,
            geographic_scope: geographic_scope?,
            result_level: result_level?,
            causality_mode: causality_mode?,
            method_class: method_class?,
            primary_indicator: primary_indicator?,
            key_research_questions,
            unit_of_analysis,
            treatment_intervention,
            sample_size,
            power_calculation,
            data_collection_methods,
            study_indicators,
            pre_analysis_plan,
            data_collection_rounds,
            start_date: start_date?,
            expected_end_date: expected_end_date?,
            data_collection_status: data_collection_status?,
            analysis_status: analysis_status?,
            funded: funded?,
            funding_source,
            total_cost_usd,
            proposal_available: proposal_available?,
            manuscript_developed: manuscript_developed?,
            policy_brief_developed: policy_brief_developed?,
            related_to_past_study: related_to_past_study?,
            intended_primary_user: intended_primary_user?,
            commissioning_source: commissioning_source?,
        })
    })();

    assembled.ok_or_else(|| {
        vec![FieldError::new("payload", "payload could not be assembled from validated fields")]
    })
}

fn non_empty_str<'a>(value: Option<&'a Value>) -> Option<&'a str> {
    match value {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.as_str()),
        _ => None,
    }
}

fn required_string(
    data: &Map<String, Value>,
    field: &str,
    max_len: usize,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    let Some(text) = non_empty_str(data.get(field)) else {
        errors.push(FieldError::new(field, format!("{field} is required")));
        return None;
    };
    if text.chars().count() > max_len {
        errors.push(FieldError::new(
            field,
            format!("{field} must be at most {max_len} characters"),
        ));
        return None;
    }
    Some(text.to_string())
}

fn is_valid_email(value: &str) -> bool {
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((head, tld)) => !head.is_empty() && !tld.is_empty(),
        None => false,
    }
}

fn is_valid_url(value: &str) -> bool {
    let rest = value.strip_prefix("https://").or_else(|| value.strip_prefix("http://"));
    matches!(rest, Some(tail) if !tail.is_empty() && !tail.chars().any(char::is_whitespace))
}

fn required_email(
    data: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    let Some(text) = non_empty_str(data.get(field)) else {
        errors.push(FieldError::new(field, format!("{field} is required")));
        return None;
    };
    if !is_valid_email(text) {
        errors.push(FieldError::new(field, format!("{field} must be a valid email")));
        return None;
    }
    Some(text.to_string())
}

fn has_date_shape(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() < 10 {
        return false;
    }
    bytes.iter().take(10).enumerate().all(|(index, byte)| match index {
        4 | 7 => *byte == b'-',
        _ => byte.is_ascii_digit(),
    })
}

fn required_date(
    data: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    let Some(text) = non_empty_str(data.get(field)) else {
        errors.push(FieldError::new(field, format!("{field} is required")));
        return None;
    };
    if !has_date_shape(text) {
        errors.push(FieldError::new(
            field,
            format!("{field} must be a valid date (YYYY-MM-DD)"),
        ));
        return None;
    }
    Some(text.to_string())
}

fn required_string_array(
    data: &Map<String, Value>,
    field: &str,
    min_len: usize,
    errors: &mut Vec<FieldError>,
) -> Option<Vec<String>> {
    let Some(Value::Array(items)) = data.get(field) else {
        errors.push(FieldError::new(
            field,
            format!("{field} must have at least {min_len} item(s)"),
        ));
        return None;
    };
    if items.len() < min_len {
        errors.push(FieldError::new(
            field,
            format!("{field} must have at least {min_len} item(s)"),
        ));
        return None;
    }
    let mut values = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(text) if !text.trim().is_empty() => values.push(text.clone()),
            _ => {
                errors.push(FieldError::new(
                    field,
                    format!("{field} items must be non-empty strings"),
                ));
                return None;
            }
        }
    }
    Some(values)
}

fn required_enum<T>(
    data: &Map<String, Value>,
    field: &str,
    parse: fn(&str) -> Option<T>,
    allowed: &[&str],
    errors: &mut Vec<FieldError>,
) -> Option<T> {
    let Some(text) = non_empty_str(data.get(field)) else {
        errors.push(FieldError::new(field, format!("{field} is required")));
        return None;
    };
    match parse(text) {
        Some(value) => Some(value),
        None => {
            errors.push(FieldError::new(
                field,
                format!("{field} must be one of: {}", allowed.join(", ")),
            ));
            None
        }
    }
}

fn required_enum_array<T>(
    data: &Map<String, Value>,
    field: &str,
    parse: fn(&str) -> Option<T>,
    min_len: usize,
    errors: &mut Vec<FieldError>,
) -> Option<Vec<T>> {
    let Some(Value::Array(items)) = data.get(field) else {
        errors.push(FieldError::new(
            field,
            format!("{field} must have at least {min_len} item(s)"),
        ));
        return None;
    };
    if items.len() < min_len {
        errors.push(FieldError::new(
            field,
            format!("{field} must have at least {min_len} item(s)"),
        ));
        return None;
    }
    let mut values = Vec::with_capacity(items.len());
    for item in items {
        let parsed = item.as_str().and_then(parse);
        match parsed {
            Some(value) => values.push(value),
            None => {
                errors.push(FieldError::new(field, format!("{field} contains invalid values")));
                return None;
            }
        }
    }
    Some(values)
}

fn required_yes_no_link(
    data: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<YesNoLink> {
    let Some(Value::Object(composite)) = data.get(field) else {
        errors.push(FieldError::new(field, format!("{field} is required")));
        return None;
    };
    let answer = match composite.get("answer").and_then(Value::as_str) {
        Some("yes") => YesNo::Yes,
        Some("no") => YesNo::No,
        _ => {
            errors.push(FieldError::new(
                field,
                format!("{field}.answer must be 'yes' or 'no'"),
            ));
            return None;
        }
    };
    let link = composite.get("link").and_then(Value::as_str).map(str::to_string);
    if answer == YesNo::Yes {
        let Some(link_text) = link.as_deref().map(str::trim).filter(|text| !text.is_empty())
        else {
            errors.push(FieldError::new(
                format!("{field}.link"),
                format!("Link is required when {field} is yes"),
            ));
            return None;
        };
        if !is_valid_url(link_text) {
            errors.push(FieldError::new(
                format!("{field}.link"),
                format!("{field} link must be a valid URL"),
            ));
            return None;
        }
    }
    Some(YesNoLink { answer, link })
}

fn optional_yes_no_link(
    data: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<YesNoLink> {
    match data.get(field) {
        None | Some(Value::Null) => None,
        Some(_) => required_yes_no_link(data, field, errors),
    }
}

fn optional_string(
    data: &Map<String, Value>,
    field: &str,
    max_len: usize,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    match data.get(field) {
        Some(Value::String(text)) => {
            if text.chars().count() > max_len {
                errors.push(FieldError::new(
                    field,
                    format!("{field} must be at most {max_len} characters"),
                ));
                None
            } else {
                Some(text.clone())
            }
        }
        _ => None,
    }
}

fn optional_enum<T>(
    data: &Map<String, Value>,
    field: &str,
    parse: fn(&str) -> Option<T>,
    allowed: &[&str],
    errors: &mut Vec<FieldError>,
) -> Option<T> {
    match data.get(field) {
        None | Some(Value::Null) => None,
        Some(value) => match value.as_str().and_then(parse) {
            Some(parsed) => Some(parsed),
            None => {
                errors.push(FieldError::new(
                    field,
                    format!("{field} must be one of: {}", allowed.join(", ")),
                ));
                None
            }
        },
    }
}

fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float.trunc() as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn optional_positive_int(
    data: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<u64> {
    match data.get(field) {
        None | Some(Value::Null) => None,
        Some(value) => match coerce_int(value) {
            Some(number) if number > 0 => u64::try_from(number).ok(),
            _ => {
                errors.push(FieldError::new(
                    field,
                    format!("{field} must be a positive integer"),
                ));
                None
            }
        },
    }
}

fn optional_positive_number(
    data: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<f64> {
    match data.get(field) {
        None | Some(Value::Null) => None,
        Some(value) => {
            let number = match value {
                Value::Number(number) => number.as_f64(),
                Value::String(text) => text.trim().parse::<f64>().ok(),
                _ => None,
            };
            match number {
                Some(float) if float > 0.0 => Some(float),
                _ => {
                    errors.push(FieldError::new(
                        field,
                        format!("{field} must be a positive number"),
                    ));
                    None
                }
            }
        }
    }
}

fn optional_string_array(
    data: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<Vec<String>> {
    match data.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(text) => values.push(text.clone()),
                    _ => {
                        errors.push(FieldError::new(
                            field,
                            format!("{field} items must be strings"),
                        ));
                        return None;
                    }
                }
            }
            Some(values)
        }
        Some(_) => {
            errors.push(FieldError::new(field, format!("{field} must be an array")));
            None
        }
    }
}
