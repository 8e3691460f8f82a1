//! Periodic self-announcement.
//!
//! On startup and every interval the service re-derives its own
//! attestation, folds the PCRs and the build/instance records into a
//! signed announcement event, and publishes it to the announce relays.
//! The announcement expires together with the attestation document, so
//! a dead instance drops off the index within hours.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use tracing::{info, warn};

use warden_core::kinds::{KIND_INSTANCE, KIND_PROFILE};
use warden_core::{now, AttestationSource, Event, EventTemplate, Signer};
use warden_relay::Relay;

use crate::doc::AttestationDoc;
use crate::error::{AttestError, AttestResult};
use crate::verify::require_prod;

pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Announcements expire with the attestation document.
const EXPIRATION_SECS: u64 = 3 * 3600;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// PCR3 (parent IAM role) is deliberately not announced.
const ANNOUNCED_PCRS: [u8; 5] = [0, 1, 2, 4, 8];

pub struct Announcer {
    pub signer: Arc<dyn Signer>,
    pub source: Arc<dyn AttestationSource>,
    pub repo: String,
    pub name: String,
    pub version: String,
    pub inbox_relay_url: String,
    pub announce_relays: Vec<String>,
    pub build: Option<Event>,
    pub instance: Option<Event>,
    pub production: bool,
    pub interval: Duration,
}

impl Announcer {
    /// Announce forever; failures retry at a tenth of the interval.
    pub async fn run(self) {
        loop {
            let pause = match self.announce_once().await {
                Ok(()) => self.interval,
                Err(e) => {
                    warn!(error = %e, "announcement failed");
                    self.interval / 10
                }
            };
            tokio::time::sleep(pause).await;
        }
    }

    pub async fn announce_once(&self) -> AttestResult<()> {
        let pubkey = self.signer.public_key();
        let pubkey_bytes =
            hex::decode(&pubkey).map_err(|e| AttestError::BadDocument(e.to_string()))?;
        let raw = self.source.attest(Some(&pubkey_bytes))?;
        if raw.is_empty() {
            return Err(AttestError::BadDocument("platform gave no attestation".into()));
        }
        let doc = AttestationDoc::parse(&raw)?;
        let (announcement, profile) = self.build_events(&raw, &doc)?;

        self.publish(self.signer.sign_event(announcement)?).await?;
        self.publish(self.signer.sign_event(profile)?).await?;
        info!(module = %doc.module_id, "announced instance");
        Ok(())
    }

    /// The environment the measurements imply.
    fn env(&self, doc: &AttestationDoc) -> &'static str {
        if doc.is_debug() {
            "debug"
        } else if self.production {
            "prod"
        } else {
            "dev"
        }
    }

    /// Assemble the announcement and profile templates.
    fn build_events(
        &self,
        raw: &[u8],
        doc: &AttestationDoc,
    ) -> AttestResult<(EventTemplate, EventTemplate)> {
        let mut tags = vec![
            vec!["r".to_owned(), self.repo.clone()],
            vec!["name".to_owned(), self.name.clone()],
            vec!["v".to_owned(), self.version.clone()],
            vec!["m".to_owned(), doc.module_id.clone()],
        ];
        for idx in ANNOUNCED_PCRS {
            tags.push(vec![
                "x".to_owned(),
                doc.pcr_hex(idx)?,
                format!("PCR{idx}"),
            ]);
        }
        tags.push(vec!["t".to_owned(), self.env(doc).to_owned()]);
        tags.push(vec!["relay".to_owned(), self.inbox_relay_url.clone()]);
        tags.push(vec![
            "expiration".to_owned(),
            (now() + EXPIRATION_SECS).to_string(),
        ]);
        tags.push(vec!["alt".to_owned(), "warden signer instance".to_owned()]);

        let mut profile_tags = vec![vec!["t".to_owned(), "warden".to_owned()]];

        if let Some(build) = &self.build {
            if self.production {
                require_prod(build, "build")?;
            }
            tags.push(vec!["build".to_owned(), serde_json::to_string(build)
                .map_err(warden_core::CoreError::from)?]);
            tags.push(vec!["p".to_owned(), build.pubkey.clone(), "builder".to_owned()]);
            profile_tags.push(vec!["p".to_owned(), build.pubkey.clone(), "builder".to_owned()]);
        }
        if let Some(instance) = &self.instance {
            if self.production {
                require_prod(instance, "instance")?;
            }
            tags.push(vec!["instance".to_owned(), serde_json::to_string(instance)
                .map_err(warden_core::CoreError::from)?]);
            tags.push(vec!["p".to_owned(), instance.pubkey.clone(), "launcher".to_owned()]);
            profile_tags.push(vec![
                "p".to_owned(),
                instance.pubkey.clone(),
                "launcher".to_owned(),
            ]);
        }

        let announcement = EventTemplate::new(KIND_INSTANCE, B64.encode(raw), tags);

        let about = format!(
            "A remote signer for Nostr keys, running inside an enclave.\n\
             Module: {}\nRepository: {}",
            doc.module_id, self.repo
        );
        let profile_content = serde_json::to_string(&serde_json::json!({
            "name": self.name,
            "about": about,
        }))
        .map_err(warden_core::CoreError::from)?;
        let profile = EventTemplate::new(KIND_PROFILE, profile_content, profile_tags);

        Ok((announcement, profile))
    }

    /// One event to every announce relay; one acceptance is enough.
    async fn publish(&self, event: Event) -> AttestResult<()> {
        let mut accepted = false;
        for url in &self.announce_relays {
            let relay = Relay::connect(url);
            match relay
                .publish_with_timeout(event.clone(), PUBLISH_TIMEOUT)
                .await
            {
                Ok(()) => accepted = true,
                Err(e) => warn!(url = %url, error = %e, "announce publish failed"),
            }
            relay.dispose();
        }
        if accepted {
            Ok(())
        } else {
            Err(AttestError::AnnounceFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::tests::synthetic_doc;
    use warden_core::{CoreResult, LocalSigner};

    struct FakeNsm(Vec<u8>);

    impl AttestationSource for FakeNsm {
        fn attest(&self, _public_key: Option<&[u8]>) -> CoreResult<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    fn record(tags: Vec<Vec<String>>) -> Event {
        LocalSigner::generate()
            .sign_event(EventTemplate::new(1, "", tags))
            .unwrap()
    }

    fn announcer(production: bool, pcr0: Vec<u8>) -> Announcer {
        let raw = synthetic_doc(
            "i-001-enc1",
            &[
                (0, pcr0),
                (1, vec![1u8; 48]),
                (2, vec![2u8; 48]),
                (4, vec![4u8; 48]),
                (8, vec![8u8; 48]),
            ],
        );
        Announcer {
            signer: Arc::new(LocalSigner::generate()),
            source: Arc::new(FakeNsm(raw)),
            repo: "https://example.com/warden".into(),
            name: "warden".into(),
            version: "0.1.0".into(),
            inbox_relay_url: "wss://inbox.example".into(),
            announce_relays: vec![],
            build: None,
            instance: None,
            production,
            interval: ANNOUNCE_INTERVAL,
        }
    }

    fn tag<'a>(template: &'a EventTemplate, name: &str) -> Option<&'a Vec<String>> {
        template.tags.iter().find(|t| t[0] == name)
    }

    #[test]
    fn test_announcement_carries_measurements() {
        let a = announcer(false, vec![9u8; 48]);
        let raw = match a.source.attest(None) {
            Ok(r) => r,
            Err(_) => unreachable!(),
        };
        let doc = AttestationDoc::parse(&raw).unwrap();
        let (announcement, profile) = a.build_events(&raw, &doc).unwrap();

        assert_eq!(announcement.kind, KIND_INSTANCE);
        assert_eq!(announcement.content, B64.encode(&raw));
        assert_eq!(tag(&announcement, "m").unwrap()[1], "i-001-enc1");
        assert_eq!(tag(&announcement, "t").unwrap()[1], "dev");
        assert_eq!(tag(&announcement, "relay").unwrap()[1], "wss://inbox.example");
        let pcr_tags: Vec<_> = announcement.tags.iter().filter(|t| t[0] == "x").collect();
        assert_eq!(pcr_tags.len(), 5);
        assert!(pcr_tags.iter().any(|t| t[2] == "PCR8" && t[1] == hex::encode([8u8; 48])));
        let expiry: u64 = tag(&announcement, "expiration").unwrap()[1].parse().unwrap();
        assert!(expiry > now());

        assert_eq!(profile.kind, KIND_PROFILE);
    }

    #[test]
    fn test_env_tag_tracks_measurements_and_flag() {
        let debug = announcer(true, vec![0u8; 48]);
        let raw = debug.source.attest(None).unwrap();
        let doc = AttestationDoc::parse(&raw).unwrap();
        assert_eq!(debug.env(&doc), "debug");

        let prod = announcer(true, vec![9u8; 48]);
        let doc = AttestationDoc::parse(&prod.source.attest(None).unwrap()).unwrap();
        assert_eq!(prod.env(&doc), "prod");
    }

    #[test]
    fn test_production_requires_prod_tagged_records() {
        let mut a = announcer(true, vec![9u8; 48]);
        a.build = Some(record(vec![vec!["t".into(), "dev".into()]]));
        let raw = a.source.attest(None).unwrap();
        let doc = AttestationDoc::parse(&raw).unwrap();
        assert!(matches!(
            a.build_events(&raw, &doc),
            Err(AttestError::NotProduction("build"))
        ));

        a.build = Some(record(vec![vec!["t".into(), "prod".into()]]));
        a.instance = Some(record(vec![vec!["t".into(), "prod".into()]]));
        let (announcement, _) = a.build_events(&raw, &doc).unwrap();
        assert!(tag(&announcement, "build").is_some());
        assert!(tag(&announcement, "instance").is_some());
        assert_eq!(
            announcement.tags.iter().filter(|t| t[0] == "p").count(),
            2
        );
    }

    #[tokio::test]
    async fn test_empty_attestation_aborts_cycle() {
        let mut a = announcer(false, vec![0u8; 48]);
        a.source = Arc::new(FakeNsm(Vec::new()));
        assert!(matches!(
            a.announce_once().await,
            Err(AttestError::BadDocument(_))
        ));
    }
}
