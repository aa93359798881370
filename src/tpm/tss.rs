use super::pcr::{PcrBank, PcrError, PcrSelection};
use super::{Result, SealedKeyObject, TpmConnection, TpmConnector, TpmError};
use log::debug;
use once_cell::sync::OnceCell;
use sha2::{Digest as _, Sha256};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tss_esapi::attributes::SessionAttributes;
use tss_esapi::constants::property_tag::PropertyTag;
use tss_esapi::constants::{SessionType, StartupType};
use tss_esapi::handles::{PcrHandle, PersistentTpmHandle};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::session_handles::{AuthSession, HmacSession, PolicySession};
use tss_esapi::structures::{Digest, DigestValues, PcrSelectionList, PcrSlot, SymmetricDefinition};
use tss_esapi::tcti_ldr::TctiNameConf;
use tss_esapi::Context;
use zeroize::Zeroizing;

pub const DEFAULT_TCTI: &str = "device:/dev/tpmrm0";

// TPMA_STARTUP_CLEAR shEnable | ehEnable
const HIERARCHIES_ENABLED: u32 = (1 << 1) | (1 << 2);

/// One context per process, created by the first successful connect.
static CONTEXT: OnceCell<Mutex<Context>> = OnceCell::new();

#[derive(Debug, Clone)]
pub struct TssConnector {
    tcti: String,
}

impl Default for TssConnector {
    fn default() -> Self {
        Self::new(DEFAULT_TCTI)
    }
}

impl TssConnector {
    pub fn new(tcti: impl Into<String>) -> Self {
        Self { tcti: tcti.into() }
    }

    fn device_missing(&self) -> bool {
        match self.tcti.strip_prefix("device:") {
            Some(conf) => {
                let device = conf.split(',').next().filter(|d| !d.is_empty());
                !Path::new(device.unwrap_or("/dev/tpm0")).exists()
            }
            None => false,
        }
    }
}

impl TpmConnector for TssConnector {
    fn connect(&self) -> Result<Box<dyn TpmConnection>> {
        if self.device_missing() {
            return Err(TpmError::NoDevice);
        }
        let context = CONTEXT.get_or_try_init(|| -> Result<_> {
            let conf = TctiNameConf::from_str(&self.tcti)?;
            debug!("TCTI config {:?}", conf);
            Ok(Mutex::new(Context::new(conf)?))
        })?;
        let mut ctx = context.lock().unwrap_or_else(PoisonError::into_inner);
        // firmware normally did this already
        if let Err(e) = ctx.startup(StartupType::Clear) {
            debug!("TPM startup: {e}");
        }
        Ok(Box::new(TssConnection { ctx }))
    }
}

struct TssConnection {
    ctx: MutexGuard<'static, Context>,
}

impl TpmConnection for TssConnection {
    fn is_enabled(&mut self) -> bool {
        match self.ctx.get_tpm_property(PropertyTag::StartupClear) {
            Ok(Some(flags)) => flags & HIERARCHIES_ENABLED == HIERARCHIES_ENABLED,
            Ok(None) => false,
            Err(e) => {
                debug!("cannot read TPM startup flags: {e}");
                false
            }
        }
    }

    fn unseal_key(&mut self, sealed_key_file: &Path) -> Result<Zeroizing<Vec<u8>>> {
        let object = SealedKeyObject::load(sealed_key_file)?;
        let handle = PersistentTpmHandle::new(object.handle)
            .map_err(|_| TpmError::InvalidHandle(object.handle))?;
        Ctx::new(&mut self.ctx)
            .pcr_auth(selection_list(&object.pcrs)?)?
            .unseal(handle)
    }

    fn block_pcr(&mut self, pcr: u8) -> Result<()> {
        let handle = pcr_handle(pcr).ok_or_else(|| PcrError::InvalidPcrSlot(pcr.to_string()))?;
        Ctx::new(&mut self.ctx).extend_random(handle)
    }
}

struct Ctx<'a, S> {
    ctx: &'a mut Context,
    state: S,
}

struct Initial;

struct PcrAuthed {
    session: AuthSession,
}

impl<S> Ctx<'_, S> {
    fn make_session(&mut self, t: SessionType) -> Result<AuthSession> {
        let session = self
            .ctx
            .start_auth_session(
                None,
                None,
                None,
                t,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )?
            .ok_or(TpmError::AuthSessionCreate)?;
        let (session_attributes, session_attributes_mask) = SessionAttributes::builder()
            .with_decrypt(true)
            .with_encrypt(true)
            .build();
        self.ctx
            .tr_sess_set_attributes(session, session_attributes, session_attributes_mask)?;
        Ok(session)
    }

    /// Policy digest of the current values of the selected PCRs.
    fn pcr_digest(&mut self, pcr_selection_list: &PcrSelectionList) -> Result<Digest> {
        let (_update_counter, _selection_list, digest_list) = self
            .ctx
            .execute_without_session(|ctx| ctx.pcr_read(pcr_selection_list.clone()))?;
        let mut hasher = Sha256::new();
        for digest in digest_list.value() {
            hasher.update(digest.value());
        }
        Ok(Digest::try_from(hasher.finalize().to_vec())?)
    }
}

impl<'a> Ctx<'a, Initial> {
    fn new(ctx: &'a mut Context) -> Self {
        Self {
            ctx,
            state: Initial,
        }
    }

    fn pcr_auth(mut self, pcr_selection_list: PcrSelectionList) -> Result<Ctx<'a, PcrAuthed>> {
        let digest = self.pcr_digest(&pcr_selection_list)?;
        let session = self.make_session(SessionType::Policy)?;
        let policy = PolicySession::try_from(session)?;
        if let Err(e) = self.ctx.policy_pcr(policy, digest, pcr_selection_list) {
            flush_session(self.ctx, session);
            return Err(e.into());
        }
        Ok(Ctx {
            ctx: self.ctx,
            state: PcrAuthed { session },
        })
    }

    fn extend_random(&mut self, pcr_handle: PcrHandle) -> Result<()> {
        let mut vals = DigestValues::new();
        vals.set(HashingAlgorithm::Sha1, self.ctx.get_random(20)?);
        vals.set(HashingAlgorithm::Sha256, self.ctx.get_random(32)?);
        let session = self.make_session(SessionType::Hmac)?;
        let extended = self
            .ctx
            .execute_with_session(Some(session), |ctx| ctx.pcr_extend(pcr_handle, vals));
        flush_session(self.ctx, session);
        Ok(extended?)
    }
}

impl Ctx<'_, PcrAuthed> {
    fn unseal(self, handle: PersistentTpmHandle) -> Result<Zeroizing<Vec<u8>>> {
        let session = self.state.session;
        let ctx = self.ctx;
        let unsealed = (|| -> Result<_> {
            let object = ctx.execute_without_session(|ctx| ctx.tr_from_tpm_public(handle.into()))?;
            let data = ctx.execute_with_session(Some(session), |ctx| ctx.unseal(object))?;
            Ok(Zeroizing::new(data.value().to_vec()))
        })();
        flush_session(ctx, session);
        unsealed
    }
}

fn flush_session(ctx: &mut Context, session: AuthSession) {
    let handle = match session {
        AuthSession::HmacSession(HmacSession::HmacSession { session_handle, .. }) => {
            Some(session_handle.into())
        }
        AuthSession::PolicySession(PolicySession::PolicySession { session_handle, .. }) => {
            Some(session_handle.into())
        }
        _ => None,
    };
    if let Some(handle) = handle {
        if let Err(e) = ctx.flush_context(handle) {
            debug!("cannot flush session: {e}");
        }
    }
}

fn selection_list(selection: &PcrSelection) -> Result<PcrSelectionList> {
    let bank = match selection.bank {
        PcrBank::Sha1 => HashingAlgorithm::Sha1,
        PcrBank::Sha256 => HashingAlgorithm::Sha256,
        PcrBank::Sha384 => HashingAlgorithm::Sha384,
    };
    let slots = selection
        .slots
        .iter()
        .map(|slot| PcrSlot::try_from(1u32 << slot))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PcrSelectionList::builder()
        .with_selection(bank, &slots)
        .build()?)
}

fn pcr_handle(pcr: u8) -> Option<PcrHandle> {
    Some(match pcr {
        0 => PcrHandle::Pcr0,
        1 => PcrHandle::Pcr1,
        2 => PcrHandle::Pcr2,
        3 => PcrHandle::Pcr3,
        4 => PcrHandle::Pcr4,
        5 => PcrHandle::Pcr5,
        6 => PcrHandle::Pcr6,
        7 => PcrHandle::Pcr7,
        8 => PcrHandle::Pcr8,
        9 => PcrHandle::Pcr9,
        10 => PcrHandle::Pcr10,
        11 => PcrHandle::Pcr11,
        12 => PcrHandle::Pcr12,
        13 => PcrHandle::Pcr13,
        14 => PcrHandle::Pcr14,
        15 => PcrHandle::Pcr15,
        16 => PcrHandle::Pcr16,
        17 => PcrHandle::Pcr17,
        18 => PcrHandle::Pcr18,
        19 => PcrHandle::Pcr19,
        20 => PcrHandle::Pcr20,
        21 => PcrHandle::Pcr21,
        22 => PcrHandle::Pcr22,
        23 => PcrHandle::Pcr23,
        _ => return None,
    })
}
