//! Host-specific materialization of profile bodies.
//!
//! A target whose body references Fleet variables is validated once (license
//! tier, CA existence) and then split into one target per host, each with its
//! own body and command UUID. Hosts whose values cannot be resolved are
//! marked failed and left out; the rest of the batch carries on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use mdmkit_core::db::{duration_secs, unix_timestamp};
use mdmkit_core::{Config, LicenseTier};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::{debug, error, info, warn};

use crate::authorities::{
    ChallengeError, DigiCertCa, DigiCertClient, GroupedCertificateAuthorities, ScepChallengeClient,
};
use crate::error::ProfileError;
use crate::storage::{DatabaseError, IDP_EMAIL_SOURCE, MdmDatabase};
use crate::types::{
    CaKind, DeliveryStatus, DispatchTarget, HostProfileKey, HostProfileRecord, ManagedCertificate,
};
use crate::variables::{self, FleetVariable, IdentityVariable};

/// Characters escaped in a URL path segment. Commas separate the proxy
/// fields and are always escaped.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b':')
    .remove(b'=')
    .remove(b'@');

/// CA name recorded for NDES managed certificates.
const NDES_CA_NAME: &str = "NDES";

/// Immutable inputs of one preprocessing pass.
#[derive(Debug, Clone)]
pub struct PreprocessSettings {
    pub mdm_url: String,
    pub scep_proxy_path: String,
    pub license: LicenseTier,
    pub authorities: GroupedCertificateAuthorities,
    /// Subtracted from "now" when a profile uses CA-backed variables, so
    /// that the install date reported by a device with a lagging clock
    /// still compares after it.
    pub clock_skew: Duration,
}

impl PreprocessSettings {
    pub fn from_config(config: &Config, authorities: GroupedCertificateAuthorities) -> Self {
        Self {
            mdm_url: config.mdm_url().to_string(),
            scep_proxy_path: config.mdm.scep_proxy_path.clone(),
            license: config.license.tier,
            authorities,
            clock_skew: config.clock_skew(),
        }
    }

    /// `{mdm_url}{proxy_path}{escaped comma-joined fields}`.
    fn proxy_url(&self, fields: &[&str]) -> String {
        let joined = fields.join(",");
        format!(
            "{}{}{}",
            self.mdm_url,
            self.scep_proxy_path,
            utf8_percent_encode(&joined, PATH_SEGMENT)
        )
    }

    /// Target-level check of a variable's prerequisites. Returns the failure
    /// detail when the license or the CA is missing.
    fn validate(&self, var: &FleetVariable) -> Option<String> {
        let premium = self.license.is_premium();
        match var {
            FleetVariable::NdesScepChallenge | FleetVariable::NdesScepProxyUrl => {
                if !premium {
                    return Some("NDES SCEP Proxy requires a Fleet Premium license.".to_string());
                }
                if self.authorities.ndes_scep_proxy.is_none() {
                    return Some(
                        "NDES SCEP Proxy is not configured. Please configure in Settings > Integrations > Certificates."
                            .to_string(),
                    );
                }
                None
            }
            FleetVariable::DigiCertPassword(ca) | FleetVariable::DigiCertData(ca) => {
                if !premium {
                    return Some("DigiCert integration requires a Fleet Premium license.".to_string());
                }
                self.authorities
                    .digicert(ca)
                    .is_none()
                    .then(|| missing_ca_detail(var, ca))
            }
            FleetVariable::CustomScepChallenge(ca) | FleetVariable::CustomScepProxyUrl(ca) => {
                if !premium {
                    return Some("Custom SCEP integration requires a Fleet Premium license.".to_string());
                }
                self.authorities
                    .custom_scep_proxy(ca)
                    .is_none()
                    .then(|| missing_ca_detail(var, ca))
            }
            FleetVariable::SmallstepScepChallenge(ca) | FleetVariable::SmallstepScepProxyUrl(ca) => {
                if !premium {
                    return Some(
                        "Smallstep SCEP integration requires a Fleet Premium license.".to_string(),
                    );
                }
                self.authorities
                    .smallstep(ca)
                    .is_none()
                    .then(|| missing_ca_detail(var, ca))
            }
            FleetVariable::ScepRenewalId | FleetVariable::Identity(_) => None,
        }
    }
}

fn missing_ca_detail(var: &FleetVariable, ca: &str) -> String {
    format!("Fleet couldn't populate {var} because {ca} certificate authority doesn't exist.")
}

fn unknown_variable_detail(name: &str) -> String {
    format!(
        "Unknown Fleet variable ${}{name} found in profile. Please update or remove.",
        variables::FLEET_VAR_PREFIX
    )
}

fn unexpected_hosts_detail(count: usize, host_uuid: &str) -> String {
    format!("Unexpected number of hosts ({count}) for UUID {host_uuid}. ")
}

fn ndes_failure_detail(err: &ChallengeError) -> String {
    let var = FleetVariable::NdesScepChallenge;
    match err {
        ChallengeError::InvalidCredentials(_) => format!(
            "Invalid NDES admin credentials. Fleet couldn't populate {var}. \
             Please update credentials in Settings > Integrations > Mobile Device Management > Simple Certificate Enrollment Protocol."
        ),
        ChallengeError::PasswordCacheFull => format!(
            "The NDES password cache is full. Fleet couldn't populate {var}. \
             Please increase the number of cached passwords in NDES and try again."
        ),
        ChallengeError::InsufficientPermissions => format!(
            "This account does not have sufficient permissions to enroll with SCEP. Fleet couldn't populate {var}. \
             Please update the account with NDES SCEP enroll permissions and try again."
        ),
        ChallengeError::Other(_) => format!("Fleet couldn't populate {var}. {err}"),
    }
}

/// Why a single host could not be materialized.
enum HostFailure {
    /// Recorded on the host-profile row; the batch continues.
    Detail(String),
    /// Aborts the whole pass.
    Fatal(ProfileError),
}

impl From<DatabaseError> for HostFailure {
    fn from(e: DatabaseError) -> Self {
        Self::Fatal(e.into())
    }
}

impl From<regex::Error> for HostFailure {
    fn from(e: regex::Error) -> Self {
        Self::Fatal(e.into())
    }
}

/// Body and certificate records produced for one host.
struct Materialized {
    body: String,
    certificates: Vec<ManagedCertificate>,
}

/// Substitutes Fleet variables into profile bodies, one copy per host.
#[derive(Clone)]
pub struct ProfilePreprocessor {
    db: MdmDatabase,
    scep: Arc<dyn ScepChallengeClient>,
    digicert: Arc<dyn DigiCertClient>,
    settings: Arc<PreprocessSettings>,
}

impl ProfilePreprocessor {
    pub fn new(
        db: MdmDatabase,
        scep: Arc<dyn ScepChallengeClient>,
        digicert: Arc<dyn DigiCertClient>,
        settings: PreprocessSettings,
    ) -> Self {
        Self {
            db,
            scep,
            digicert,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &PreprocessSettings {
        &self.settings
    }

    /// Expand `targets` in place.
    ///
    /// Each profile UUID is either kept (no variables), removed (the target
    /// failed validation) or replaced by one temporary UUID per surviving
    /// host. The temporary UUID doubles as the host's command UUID, and its
    /// materialized body is added to `contents`. `host_profiles` is updated
    /// with the new command UUIDs and any failures, and the changes are
    /// persisted.
    pub async fn preprocess_targets(
        &self,
        targets: &mut HashMap<String, DispatchTarget>,
        contents: &mut HashMap<String, String>,
        host_profiles: &mut HashMap<HostProfileKey, HostProfileRecord>,
        user_enrollments: &HashMap<String, String>,
    ) -> Result<(), ProfileError> {
        let mut profile_uuids: Vec<String> = targets.keys().cloned().collect();
        profile_uuids.sort();

        let mut added: Vec<(String, DispatchTarget, String)> = Vec::new();
        for profile_uuid in profile_uuids {
            let Some(body) = contents.get(&profile_uuid).cloned() else {
                continue;
            };
            let names = variables::find(&body);
            if names.is_empty() {
                continue;
            }
            let Some(target) = targets.get(&profile_uuid).cloned() else {
                continue;
            };

            let parsed: Vec<Option<FleetVariable>> =
                names.iter().map(|n| FleetVariable::parse(n)).collect();
            let variables_updated_at = parsed
                .iter()
                .flatten()
                .any(FleetVariable::is_ca_backed)
                .then(|| unix_timestamp() - duration_secs(self.settings.clock_skew));

            let mut vars = Vec::with_capacity(parsed.len());
            let mut rejection = None;
            for (name, var) in names.iter().zip(parsed) {
                match var {
                    None => {
                        rejection = Some((unknown_variable_detail(name), variables_updated_at));
                        break;
                    }
                    Some(var) => {
                        if let Some(detail) = self.settings.validate(&var) {
                            rejection = Some((detail, Some(unix_timestamp())));
                            break;
                        }
                        vars.push(var);
                    }
                }
            }

            if let Some((detail, updated_at)) = rejection {
                self.fail_target(
                    &profile_uuid,
                    &target,
                    &detail,
                    updated_at,
                    host_profiles,
                    user_enrollments,
                )
                .await?;
                targets.remove(&profile_uuid);
                continue;
            }

            let mut to_update = Vec::with_capacity(target.enrollment_ids.len());
            let mut certificates = Vec::new();
            for enrollment_id in &target.enrollment_ids {
                let Some(key) =
                    find_host_profile(host_profiles, user_enrollments, enrollment_id, &profile_uuid)
                else {
                    debug!(
                        enrollment_id = %enrollment_id,
                        profile_uuid = %profile_uuid,
                        "no host profile for enrollment, skipping"
                    );
                    continue;
                };
                let host_uuid = key.host_uuid.clone();
                let temp_uuid = uuid::Uuid::new_v4().to_string();

                match self
                    .materialize(&vars, &body, &host_uuid, &profile_uuid)
                    .await
                {
                    Ok(materialized) => {
                        let Some(record) = host_profiles.get_mut(&key) else {
                            continue;
                        };
                        record.command_uuid.clone_from(&temp_uuid);
                        record.variables_updated_at = variables_updated_at;
                        to_update.push(record.clone());
                        certificates.extend(materialized.certificates);
                        added.push((
                            temp_uuid.clone(),
                            DispatchTarget {
                                command_uuid: temp_uuid,
                                profile_identifier: target.profile_identifier.clone(),
                                enrollment_ids: vec![enrollment_id.clone()],
                            },
                            materialized.body,
                        ));
                    }
                    Err(HostFailure::Detail(detail)) => {
                        warn!(
                            host_uuid = %host_uuid,
                            profile_uuid = %profile_uuid,
                            detail = %detail,
                            "profile variables could not be populated for host"
                        );
                        let Some(record) = host_profiles.get_mut(&key) else {
                            continue;
                        };
                        record.command_uuid.clone_from(&target.command_uuid);
                        record.variables_updated_at = variables_updated_at;
                        record.status = Some(DeliveryStatus::Failed);
                        record.detail = detail;
                        self.db
                            .upsert_host_profiles(std::slice::from_ref(record))
                            .await?;
                    }
                    Err(HostFailure::Fatal(e)) => return Err(e),
                }
            }

            self.db.upsert_host_profiles(&to_update).await?;
            self.db.insert_managed_certificates(&certificates).await?;
            targets.remove(&profile_uuid);

            info!(
                profile_uuid = %profile_uuid,
                hosts = to_update.len(),
                failed = target.enrollment_ids.len() - to_update.len(),
                "materialized host-specific profiles"
            );
        }

        for (temp_uuid, target, body) in added {
            contents.insert(temp_uuid.clone(), body);
            targets.insert(temp_uuid, target);
        }
        Ok(())
    }

    /// Mark every host of a target failed in one upsert.
    async fn fail_target(
        &self,
        profile_uuid: &str,
        target: &DispatchTarget,
        detail: &str,
        variables_updated_at: Option<i64>,
        host_profiles: &mut HashMap<HostProfileKey, HostProfileRecord>,
        user_enrollments: &HashMap<String, String>,
    ) -> Result<(), ProfileError> {
        let mut failed = Vec::with_capacity(target.enrollment_ids.len());
        for enrollment_id in &target.enrollment_ids {
            let Some(key) =
                find_host_profile(host_profiles, user_enrollments, enrollment_id, profile_uuid)
            else {
                continue;
            };
            if let Some(record) = host_profiles.get_mut(&key) {
                record.status = Some(DeliveryStatus::Failed);
                record.detail = detail.to_string();
                record.variables_updated_at = variables_updated_at;
                failed.push(record.clone());
            }
        }
        self.db.upsert_host_profiles(&failed).await?;

        warn!(
            profile_uuid = %profile_uuid,
            hosts = failed.len(),
            detail = %detail,
            "profile failed validation"
        );
        Ok(())
    }

    /// Substitute every variable of the body for one host.
    async fn materialize(
        &self,
        vars: &[FleetVariable],
        body: &str,
        host_uuid: &str,
        profile_uuid: &str,
    ) -> Result<Materialized, HostFailure> {
        let mut body = body.to_string();
        let mut certificates = Vec::new();
        let mut identity_cache: HashMap<IdentityVariable, String> = HashMap::new();
        let mut digicert_issued: HashSet<&str> = HashSet::new();

        for var in vars {
            let name = var.name();
            match var {
                FleetVariable::NdesScepChallenge => {
                    let Some(ca) = self.settings.authorities.ndes_scep_proxy.as_ref() else {
                        continue;
                    };
                    let challenge = self
                        .scep
                        .ndes_challenge(ca)
                        .await
                        .map_err(|e| HostFailure::Detail(ndes_failure_detail(&e)))?;
                    certificates.push(ManagedCertificate {
                        host_uuid: host_uuid.to_string(),
                        profile_uuid: profile_uuid.to_string(),
                        ca_name: NDES_CA_NAME.to_string(),
                        kind: CaKind::Ndes,
                        challenge_retrieved_at: Some(unix_timestamp()),
                        not_valid_before: None,
                        not_valid_after: None,
                        serial: None,
                    });
                    body = variables::replace(&body, &name, &challenge)?;
                }
                FleetVariable::NdesScepProxyUrl => {
                    let url = self
                        .settings
                        .proxy_url(&[host_uuid, profile_uuid, NDES_CA_NAME]);
                    body = variables::replace(&body, &name, &url)?;
                }
                FleetVariable::ScepRenewalId => {
                    body = variables::replace(&body, &name, &format!("fleet-{profile_uuid}"))?;
                }
                FleetVariable::CustomScepChallenge(ca_name) => {
                    let Some(ca) = self.settings.authorities.custom_scep_proxy(ca_name) else {
                        error!(ca_name = %ca_name, "custom SCEP CA disappeared after validation");
                        continue;
                    };
                    body = variables::replace_exact_token(&body, &name, &ca.challenge)?;
                }
                FleetVariable::CustomScepProxyUrl(ca_name) => {
                    let challenge = self.db.new_scep_challenge().await.map_err(|e| {
                        HostFailure::Detail(format!("Fleet couldn't populate {var}. {e}"))
                    })?;
                    let url = self
                        .settings
                        .proxy_url(&[host_uuid, profile_uuid, ca_name, &challenge]);
                    body = variables::replace_exact_token(&body, &name, &url)?;
                    certificates.push(ManagedCertificate {
                        host_uuid: host_uuid.to_string(),
                        profile_uuid: profile_uuid.to_string(),
                        ca_name: ca_name.clone(),
                        kind: CaKind::CustomScepProxy,
                        challenge_retrieved_at: None,
                        not_valid_before: None,
                        not_valid_after: None,
                        serial: None,
                    });
                }
                FleetVariable::SmallstepScepChallenge(ca_name) => {
                    let Some(ca) = self.settings.authorities.smallstep(ca_name) else {
                        error!(ca_name = %ca_name, "Smallstep CA disappeared after validation");
                        continue;
                    };
                    let challenge = self.scep.smallstep_challenge(ca).await.map_err(|e| {
                        HostFailure::Detail(format!("Fleet couldn't populate {var}. {e}"))
                    })?;
                    info!(
                        host_uuid = %host_uuid,
                        profile_uuid = %profile_uuid,
                        "retrieved SCEP challenge from Smallstep"
                    );
                    certificates.push(ManagedCertificate {
                        host_uuid: host_uuid.to_string(),
                        profile_uuid: profile_uuid.to_string(),
                        ca_name: ca_name.clone(),
                        kind: CaKind::Smallstep,
                        challenge_retrieved_at: Some(unix_timestamp()),
                        not_valid_before: None,
                        not_valid_after: None,
                        serial: None,
                    });
                    body = variables::replace_exact_token(&body, &name, &challenge)?;
                }
                FleetVariable::SmallstepScepProxyUrl(ca_name) => {
                    let url = self.settings.proxy_url(&[host_uuid, profile_uuid, ca_name]);
                    body = variables::replace_exact_token(&body, &name, &url)?;
                }
                FleetVariable::DigiCertPassword(ca_name) | FleetVariable::DigiCertData(ca_name) => {
                    if !digicert_issued.insert(ca_name.as_str()) {
                        continue;
                    }
                    let Some(ca) = self.settings.authorities.digicert(ca_name) else {
                        error!(ca_name = %ca_name, "DigiCert CA disappeared after validation");
                        continue;
                    };
                    let ca = self
                        .populate_digicert_fields(ca, host_uuid, &mut identity_cache)
                        .await?;
                    let cert = self.digicert.issue_certificate(&ca).await.map_err(|e| {
                        HostFailure::Detail(format!(
                            "Couldn't get certificate from DigiCert for {}. {e}",
                            ca.name
                        ))
                    })?;

                    let data_var = FleetVariable::DigiCertData(ca_name.clone()).name();
                    let password_var = FleetVariable::DigiCertPassword(ca_name.clone()).name();
                    body = variables::replace_exact_token(
                        &body,
                        &data_var,
                        &STANDARD.encode(&cert.pfx_data),
                    )?;
                    body = variables::replace_exact_token(&body, &password_var, &cert.password)?;
                    certificates.push(ManagedCertificate {
                        host_uuid: host_uuid.to_string(),
                        profile_uuid: profile_uuid.to_string(),
                        ca_name: ca_name.clone(),
                        kind: CaKind::DigiCert,
                        challenge_retrieved_at: None,
                        not_valid_before: Some(cert.not_valid_before),
                        not_valid_after: Some(cert.not_valid_after),
                        serial: Some(cert.serial_number),
                    });
                }
                FleetVariable::Identity(id) => {
                    let value = self.identity_value(*id, host_uuid, &mut identity_cache).await?;
                    body = variables::replace(&body, &name, &value)?;
                }
            }
        }

        Ok(Materialized { body, certificates })
    }

    /// Copy of the DigiCert CA with the host's email and serial substituted
    /// into the common name, seat ID and UPNs.
    async fn populate_digicert_fields(
        &self,
        ca: &DigiCertCa,
        host_uuid: &str,
        cache: &mut HashMap<IdentityVariable, String>,
    ) -> Result<DigiCertCa, HostFailure> {
        let mut ca = ca.clone();
        ca.certificate_common_name = self
            .substitute_identity(&ca.certificate_common_name, host_uuid, cache)
            .await?;
        ca.certificate_seat_id = self
            .substitute_identity(&ca.certificate_seat_id, host_uuid, cache)
            .await?;
        let mut upns = Vec::with_capacity(ca.certificate_user_principal_names.len());
        for upn in &ca.certificate_user_principal_names {
            upns.push(self.substitute_identity(upn, host_uuid, cache).await?);
        }
        ca.certificate_user_principal_names = upns;
        Ok(ca)
    }

    async fn substitute_identity(
        &self,
        item: &str,
        host_uuid: &str,
        cache: &mut HashMap<IdentityVariable, String>,
    ) -> Result<String, HostFailure> {
        let mut item = item.to_string();
        for name in variables::find(&item) {
            let id = match FleetVariable::parse(&name) {
                Some(FleetVariable::Identity(
                    id @ (IdentityVariable::EndUserEmailIdp | IdentityVariable::HardwareSerial),
                )) => id,
                _ => continue,
            };
            let value = self.identity_value(id, host_uuid, cache).await?;
            item = variables::replace(&item, &name, &value)?;
        }
        Ok(item)
    }

    /// Resolve an identity attribute of the host, caching it for the rest of
    /// the host's substitutions.
    async fn identity_value(
        &self,
        id: IdentityVariable,
        host_uuid: &str,
        cache: &mut HashMap<IdentityVariable, String>,
    ) -> Result<String, HostFailure> {
        if let Some(value) = cache.get(&id) {
            return Ok(value.clone());
        }

        let value = match id {
            IdentityVariable::EndUserEmailIdp => {
                let emails = self.db.host_emails(host_uuid, IDP_EMAIL_SOURCE).await?;
                emails.into_iter().next().ok_or_else(|| {
                    HostFailure::Detail(format!(
                        "There is no IdP email for this host. Fleet couldn't populate {}. \
                         [Learn more](https://fleetdm.com/learn-more-about/idp-email)",
                        FleetVariable::Identity(id)
                    ))
                })?
            }
            IdentityVariable::HardwareSerial => {
                let hosts = self.db.list_hosts_by_uuid(host_uuid).await?;
                match hosts.as_slice() {
                    [host] => host.hardware_serial.clone(),
                    _ => {
                        return Err(HostFailure::Detail(unexpected_hosts_detail(
                            hosts.len(),
                            host_uuid,
                        )));
                    }
                }
            }
            IdentityVariable::IdpUsername
            | IdentityVariable::IdpUsernameLocalPart
            | IdentityVariable::IdpGroups
            | IdentityVariable::IdpDepartment
            | IdentityVariable::IdpFullName => self.idp_user_value(id, host_uuid).await?,
        };

        cache.insert(id, value.clone());
        Ok(value)
    }

    async fn idp_user_value(&self, id: IdentityVariable, host_uuid: &str) -> Result<String, HostFailure> {
        let hosts = self.db.list_hosts_by_uuid(host_uuid).await?;
        let [host] = hosts.as_slice() else {
            return Err(HostFailure::Detail(unexpected_hosts_detail(
                hosts.len(),
                host_uuid,
            )));
        };

        let var = FleetVariable::Identity(id);
        let no_groups = format!("There is no IdP groups for this host. Fleet couldn’t populate {var}.");
        let no_department =
            format!("There is no IdP department for this host. Fleet couldn’t populate {var}.");
        let no_full_name =
            format!("There is no IdP full name for this host. Fleet couldn’t populate {var}.");

        let user = self
            .db
            .host_end_user(host.id)
            .await?
            .filter(|u| !u.username.is_empty());
        let Some(user) = user else {
            let detail = match id {
                IdentityVariable::IdpGroups => no_groups,
                IdentityVariable::IdpDepartment => no_department,
                IdentityVariable::IdpFullName => no_full_name,
                _ => format!(
                    "There is no IdP username for this host. Fleet couldn't populate {var}."
                ),
            };
            return Err(HostFailure::Detail(detail));
        };

        match id {
            IdentityVariable::IdpUsername => Ok(user.username),
            IdentityVariable::IdpUsernameLocalPart => Ok(email_local_part(&user.username).to_string()),
            IdentityVariable::IdpGroups if user.groups.is_empty() => Err(HostFailure::Detail(no_groups)),
            IdentityVariable::IdpGroups => Ok(user.groups.join(",")),
            IdentityVariable::IdpDepartment if user.department.is_empty() => {
                Err(HostFailure::Detail(no_department))
            }
            IdentityVariable::IdpDepartment => Ok(user.department),
            IdentityVariable::IdpFullName => {
                let full_name = user.full_name.trim();
                if full_name.is_empty() {
                    Err(HostFailure::Detail(no_full_name))
                } else {
                    Ok(full_name.to_string())
                }
            }
            IdentityVariable::EndUserEmailIdp | IdentityVariable::HardwareSerial => Ok(String::new()),
        }
    }
}

/// The part of an email before `@`, or the whole string.
fn email_local_part(email: &str) -> &str {
    email.split_once('@').map_or(email, |(local, _)| local)
}

/// Locate the host-profile row for an enrollment. User-channel enrollment IDs
/// are translated to their host UUID when the direct lookup misses.
fn find_host_profile(
    host_profiles: &HashMap<HostProfileKey, HostProfileRecord>,
    user_enrollments: &HashMap<String, String>,
    enrollment_id: &str,
    profile_uuid: &str,
) -> Option<HostProfileKey> {
    let key = HostProfileKey::new(enrollment_id, profile_uuid);
    if host_profiles.contains_key(&key) {
        return Some(key);
    }
    let host_uuid = user_enrollments.get(enrollment_id)?;
    let key = HostProfileKey::new(host_uuid.as_str(), profile_uuid);
    host_profiles.contains_key(&key).then_some(key)
}
