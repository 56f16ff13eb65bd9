//! Loads the device key table into the cipher engine's key SRAM.

use std::sync::Arc;
use std::time::Duration;

use hdcp_transport::{
    EngineReg, KeyCtrl, KeySource, KEY_DEBUG0_SRAM_BUSY, KEY_TABLE_WORDS, KEY_TRIG_LOAD_HDCP_KEY,
};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cipher::Cipher;
use crate::errors::HdcpError;

const SRAM_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Copies the key fuse contents into the engine, once per attempt.
#[derive(Clone)]
pub struct KeyTableLoader {
    source: Arc<dyn KeySource>,
    key_timeout: Duration,
    sram_clear_attempts: u32,
}

impl KeyTableLoader {
    pub fn new(source: Arc<dyn KeySource>, key_timeout: Duration, sram_clear_attempts: u32) -> Self {
        Self {
            source,
            key_timeout,
            sram_clear_attempts: sram_clear_attempts.max(1),
        }
    }

    /// Load the key table into the engine.
    ///
    /// `repeater` is only logged: the load sequence is the same either way,
    /// and the receiver's repeater bit reaches the engine with the Bksv MSB.
    pub async fn load(&self, cipher: &Cipher, repeater: bool) -> Result<(), HdcpError> {
        let table = self.source.read_key_table()?;
        let engine = cipher.engine();

        engine.write(EngineReg::KeyCtrl, KeyCtrl::LOCAL_KEYS.bits());
        engine.modify(
            EngineReg::KeyCtrl,
            0,
            (KeyCtrl::PKEY_RELOAD_TRIGGER | KeyCtrl::LOCAL_KEYS).bits(),
        );
        if engine
            .wait_for(EngineReg::KeyCtrl, KeyCtrl::PKEY_LOADED.bits(), self.key_timeout)
            .await
            .is_err()
        {
            warn!("key reload timed out");
            return Err(HdcpError::ProtocolTimeout {
                condition: "key reload",
            });
        }

        engine.write(EngineReg::KeySkeyIndex, 0);
        self.wait_sram_clear(cipher).await?;

        for (i, block) in table.words().chunks_exact(4).enumerate() {
            engine.write(EngineReg::KeyHdcpKey0, block[0]);
            engine.write(EngineReg::KeyHdcpKey1, block[1]);
            engine.write(EngineReg::KeyHdcpKey2, block[2]);
            engine.write(EngineReg::KeyHdcpKey3, block[3]);
            engine.write(EngineReg::KeyHdcpKeyTrig, KEY_TRIG_LOAD_HDCP_KEY);

            let mut ctrl = KeyCtrl::LOCAL_KEYS | KeyCtrl::WRITE16;
            if i > 0 {
                ctrl |= KeyCtrl::AUTOINC;
            }
            engine.write(EngineReg::KeyCtrl, ctrl.bits());
        }
        drop(table);

        debug!(words = KEY_TABLE_WORDS, repeater, "key table loaded");
        Ok(())
    }

    async fn wait_sram_clear(&self, cipher: &Cipher) -> Result<(), HdcpError> {
        for _ in 0..self.sram_clear_attempts {
            if cipher.engine().read(EngineReg::KeyDebug0) & KEY_DEBUG0_SRAM_BUSY == 0 {
                return Ok(());
            }
            sleep(SRAM_POLL_INTERVAL).await;
        }
        warn!("key SRAM clear timed out");
        Err(HdcpError::ProtocolTimeout {
            condition: "key SRAM clear",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdcp_transport::testing::{EngineProfile, EventLog, HwEvent, SimulatedEngine, StaticKeySource};

    fn loader(keys: Arc<StaticKeySource>) -> KeyTableLoader {
        KeyTableLoader::new(keys, Duration::from_millis(20), 6)
    }

    #[tokio::test(start_paused = true)]
    async fn test_loads_every_word() {
        let log = EventLog::new();
        let engine = Arc::new(SimulatedEngine::new(EngineProfile::healthy(4), log.clone()));
        let keys = Arc::new(StaticKeySource::from_seed(4));

        loader(keys.clone())
            .load(&Cipher::new(engine.clone()), false)
            .await
            .unwrap();

        assert_eq!(engine.key_words_loaded(), KEY_TABLE_WORDS);
        assert_eq!(keys.reads(), 1);
        assert_eq!(
            log.count(|e| matches!(
                e,
                HwEvent::EngineWrite {
                    reg: EngineReg::KeyHdcpKeyTrig,
                    ..
                }
            )),
            KEY_TABLE_WORDS / 4
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeater_flag_does_not_change_the_load() {
        let mut writes = Vec::new();
        for repeater in [false, true] {
            let log = EventLog::new();
            let engine = Arc::new(SimulatedEngine::new(EngineProfile::healthy(4), log.clone()));
            loader(Arc::new(StaticKeySource::from_seed(4)))
                .load(&Cipher::new(engine), repeater)
                .await
                .unwrap();
            writes.push(log.events());
        }
        assert!(!writes[0].is_empty());
        assert_eq!(writes[0], writes[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fuse_failure() {
        let engine = Arc::new(SimulatedEngine::new(EngineProfile::healthy(4), EventLog::new()));
        let keys = Arc::new(StaticKeySource::from_seed(4));
        keys.set_failing(true);

        let err = loader(keys).load(&Cipher::new(engine), false).await.unwrap_err();
        assert!(matches!(err, HdcpError::KeyTable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_timeout() {
        let mut profile = EngineProfile::healthy(4);
        profile.key_reload_stuck = true;
        let engine = Arc::new(SimulatedEngine::new(profile, EventLog::new()));

        let err = loader(Arc::new(StaticKeySource::from_seed(4)))
            .load(&Cipher::new(engine.clone()), false)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HdcpError::ProtocolTimeout {
                condition: "key reload"
            }
        );
        assert_eq!(engine.key_words_loaded(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sram_busy() {
        let mut profile = EngineProfile::healthy(4);
        profile.sram_busy = true;
        let engine = Arc::new(SimulatedEngine::new(profile, EventLog::new()));

        let err = loader(Arc::new(StaticKeySource::from_seed(4)))
            .load(&Cipher::new(engine), false)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HdcpError::ProtocolTimeout {
                condition: "key SRAM clear"
            }
        );
    }
}
