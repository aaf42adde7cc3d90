//! Fleet variable grammar.
//!
//! Profiles reference dynamic values as `$FLEET_VAR_<NAME>` or
//! `${FLEET_VAR_<NAME>}` where `NAME` is `[A-Z0-9_]+`. Names are parsed once
//! into [`FleetVariable`] and replaced with XML-escaped values.

use std::fmt;
use std::sync::LazyLock;

use regex::{NoExpand, Regex};

/// Prefix shared by every variable name.
pub const FLEET_VAR_PREFIX: &str = "FLEET_VAR_";

static VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$FLEET_VAR_([A-Z0-9_]+)|\$\{FLEET_VAR_([A-Z0-9_]+)\}")
        .expect("static regex is valid")
});

static SECRET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$FLEET_SECRET_[A-Z0-9_]+|\$\{FLEET_SECRET_[A-Z0-9_]+\}")
        .expect("static regex is valid")
});

const NDES_SCEP_CHALLENGE: &str = "NDES_SCEP_CHALLENGE";
const NDES_SCEP_PROXY_URL: &str = "NDES_SCEP_PROXY_URL";
const SCEP_RENEWAL_ID: &str = "SCEP_RENEWAL_ID";
const HOST_END_USER_EMAIL_IDP: &str = "HOST_END_USER_EMAIL_IDP";
const HOST_HARDWARE_SERIAL: &str = "HOST_HARDWARE_SERIAL";
const HOST_END_USER_IDP_USERNAME: &str = "HOST_END_USER_IDP_USERNAME";
const HOST_END_USER_IDP_USERNAME_LOCAL_PART: &str = "HOST_END_USER_IDP_USERNAME_LOCAL_PART";
const HOST_END_USER_IDP_GROUPS: &str = "HOST_END_USER_IDP_GROUPS";
const HOST_END_USER_IDP_DEPARTMENT: &str = "HOST_END_USER_IDP_DEPARTMENT";
const HOST_END_USER_IDP_FULL_NAME: &str = "HOST_END_USER_IDP_FULL_NAME";

const DIGICERT_PASSWORD_PREFIX: &str = "DIGICERT_PASSWORD_";
const DIGICERT_DATA_PREFIX: &str = "DIGICERT_DATA_";
const CUSTOM_SCEP_CHALLENGE_PREFIX: &str = "CUSTOM_SCEP_CHALLENGE_";
const CUSTOM_SCEP_PROXY_URL_PREFIX: &str = "CUSTOM_SCEP_PROXY_URL_";
const SMALLSTEP_SCEP_CHALLENGE_PREFIX: &str = "SMALLSTEP_SCEP_CHALLENGE_";
const SMALLSTEP_SCEP_PROXY_URL_PREFIX: &str = "SMALLSTEP_SCEP_PROXY_URL_";

/// Identity attribute of the host or its end user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityVariable {
    EndUserEmailIdp,
    HardwareSerial,
    IdpUsername,
    IdpUsernameLocalPart,
    IdpGroups,
    IdpDepartment,
    IdpFullName,
}

impl IdentityVariable {
    pub const fn name(self) -> &'static str {
        match self {
            Self::EndUserEmailIdp => HOST_END_USER_EMAIL_IDP,
            Self::HardwareSerial => HOST_HARDWARE_SERIAL,
            Self::IdpUsername => HOST_END_USER_IDP_USERNAME,
            Self::IdpUsernameLocalPart => HOST_END_USER_IDP_USERNAME_LOCAL_PART,
            Self::IdpGroups => HOST_END_USER_IDP_GROUPS,
            Self::IdpDepartment => HOST_END_USER_IDP_DEPARTMENT,
            Self::IdpFullName => HOST_END_USER_IDP_FULL_NAME,
        }
    }
}

/// A parsed Fleet variable. Per-CA variants carry the CA name suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FleetVariable {
    NdesScepChallenge,
    NdesScepProxyUrl,
    ScepRenewalId,
    Identity(IdentityVariable),
    DigiCertPassword(String),
    DigiCertData(String),
    CustomScepChallenge(String),
    CustomScepProxyUrl(String),
    SmallstepScepChallenge(String),
    SmallstepScepProxyUrl(String),
}

impl FleetVariable {
    /// Parse a variable name (without the `FLEET_VAR_` prefix). Returns
    /// `None` for unknown names.
    pub fn parse(name: &str) -> Option<Self> {
        let fixed = match name {
            NDES_SCEP_CHALLENGE => Some(Self::NdesScepChallenge),
            NDES_SCEP_PROXY_URL => Some(Self::NdesScepProxyUrl),
            SCEP_RENEWAL_ID => Some(Self::ScepRenewalId),
            HOST_END_USER_EMAIL_IDP => Some(Self::Identity(IdentityVariable::EndUserEmailIdp)),
            HOST_HARDWARE_SERIAL => Some(Self::Identity(IdentityVariable::HardwareSerial)),
            HOST_END_USER_IDP_USERNAME => Some(Self::Identity(IdentityVariable::IdpUsername)),
            HOST_END_USER_IDP_USERNAME_LOCAL_PART => {
                Some(Self::Identity(IdentityVariable::IdpUsernameLocalPart))
            }
            HOST_END_USER_IDP_GROUPS => Some(Self::Identity(IdentityVariable::IdpGroups)),
            HOST_END_USER_IDP_DEPARTMENT => Some(Self::Identity(IdentityVariable::IdpDepartment)),
            HOST_END_USER_IDP_FULL_NAME => Some(Self::Identity(IdentityVariable::IdpFullName)),
            _ => None,
        };
        if fixed.is_some() {
            return fixed;
        }

        let prefixed: [(&str, fn(String) -> Self); 6] = [
            (DIGICERT_PASSWORD_PREFIX, Self::DigiCertPassword),
            (DIGICERT_DATA_PREFIX, Self::DigiCertData),
            (CUSTOM_SCEP_CHALLENGE_PREFIX, Self::CustomScepChallenge),
            (CUSTOM_SCEP_PROXY_URL_PREFIX, Self::CustomScepProxyUrl),
            (SMALLSTEP_SCEP_CHALLENGE_PREFIX, Self::SmallstepScepChallenge),
            (SMALLSTEP_SCEP_PROXY_URL_PREFIX, Self::SmallstepScepProxyUrl),
        ];
        prefixed.into_iter().find_map(|(prefix, build)| {
            name.strip_prefix(prefix)
                .map(|ca_name| build(ca_name.to_string()))
        })
    }

    /// The variable name without the `FLEET_VAR_` prefix.
    pub fn name(&self) -> String {
        match self {
            Self::NdesScepChallenge => NDES_SCEP_CHALLENGE.to_string(),
            Self::NdesScepProxyUrl => NDES_SCEP_PROXY_URL.to_string(),
            Self::ScepRenewalId => SCEP_RENEWAL_ID.to_string(),
            Self::Identity(id) => id.name().to_string(),
            Self::DigiCertPassword(ca) => format!("{DIGICERT_PASSWORD_PREFIX}{ca}"),
            Self::DigiCertData(ca) => format!("{DIGICERT_DATA_PREFIX}{ca}"),
            Self::CustomScepChallenge(ca) => format!("{CUSTOM_SCEP_CHALLENGE_PREFIX}{ca}"),
            Self::CustomScepProxyUrl(ca) => format!("{CUSTOM_SCEP_PROXY_URL_PREFIX}{ca}"),
            Self::SmallstepScepChallenge(ca) => format!("{SMALLSTEP_SCEP_CHALLENGE_PREFIX}{ca}"),
            Self::SmallstepScepProxyUrl(ca) => format!("{SMALLSTEP_SCEP_PROXY_URL_PREFIX}{ca}"),
        }
    }

    /// Variables backed by a certificate authority integration. Their
    /// presence moves the profile's install baseline back by the clock
    /// skew allowance.
    pub const fn is_ca_backed(&self) -> bool {
        !matches!(self, Self::Identity(_))
    }

    /// Per-CA variables are replaced only when they are the sole content of
    /// an XML element.
    pub const fn is_exact_token(&self) -> bool {
        matches!(
            self,
            Self::DigiCertPassword(_)
                | Self::DigiCertData(_)
                | Self::CustomScepChallenge(_)
                | Self::CustomScepProxyUrl(_)
                | Self::SmallstepScepChallenge(_)
                | Self::SmallstepScepProxyUrl(_)
        )
    }
}

impl fmt::Display for FleetVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${FLEET_VAR_PREFIX}{}", self.name())
    }
}

/// Distinct variable names (without prefix) in order of first appearance.
pub fn find(contents: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in VARIABLE_RE.captures_iter(contents) {
        let Some(name) = caps.get(1).or_else(|| caps.get(2)) else {
            continue;
        };
        if !names.iter().any(|n| n == name.as_str()) {
            names.push(name.as_str().to_string());
        }
    }
    names
}

/// True when the text references a server secret. Such profiles must reach
/// the queue unsigned so the secret is only expanded at delivery time.
pub fn contains_secrets(contents: &str) -> bool {
    SECRET_RE.is_match(contents)
}

/// Escape text for inclusion in XML character data.
pub fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            other => out.push(other),
        }
    }
    out
}

/// Replace every occurrence of a fixed-name variable with the XML-escaped
/// value.
pub fn replace(contents: &str, name: &str, value: &str) -> Result<String, regex::Error> {
    let name = regex::escape(name);
    let re = Regex::new(&format!(r"\$FLEET_VAR_{name}\b|\$\{{FLEET_VAR_{name}\}}"))?;
    let escaped = xml_escape(value);
    Ok(re.replace_all(contents, NoExpand(&escaped)).into_owned())
}

/// Replace a variable that is the only content of an XML element, dropping
/// surrounding whitespace: `<data> $FLEET_VAR_X </data>` becomes
/// `<data>value</data>`.
pub fn replace_exact_token(contents: &str, name: &str, value: &str) -> Result<String, regex::Error> {
    let name = regex::escape(name);
    let re = Regex::new(&format!(
        r">\s*(?:\$FLEET_VAR_{name}\b|\$\{{FLEET_VAR_{name}\}})\s*<"
    ))?;
    let replacement = format!(">{}<", xml_escape(value));
    Ok(re.replace_all(contents, NoExpand(&replacement)).into_owned())
}
