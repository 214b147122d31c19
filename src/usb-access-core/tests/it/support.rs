//! In-memory collaborators and a single-threaded harness around the engine.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use usb_access_core::{
    CertificateReader, CertificateVerifier, CertificateWorkflow, CertificationPolicy,
    Collaborators, DeviceClassifier, DeviceId, DeviceProperties, DeviceRegistry,
    DispatchOutcome, EventQueue, FsmEngine, PolicyEnforcer, PolicyError, PolicyRetry,
    PolicyTarget, PropertyClassifier, SignatureLocator, TransitionTable, UsbDevice, UsbEvent,
    VerifierError,
};

pub const CERT_PEM: &[u8] = b"-----BEGIN CERTIFICATE-----\nMIIBdevice\n-----END CERTIFICATE-----\n";

/// Classifier that counts calls and delegates to [`PropertyClassifier`].
#[derive(Default)]
pub struct CountingClassifier {
    pub calls: AtomicU32,
}

impl DeviceClassifier for CountingClassifier {
    fn is_storage(&self, properties: &DeviceProperties) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        PropertyClassifier.is_storage(properties)
    }
}

/// Enforcer that records every call and always succeeds.
#[derive(Default)]
pub struct RecordingEnforcer {
    pub calls: Mutex<Vec<(DeviceId, PolicyTarget)>>,
}

impl PolicyEnforcer for RecordingEnforcer {
    fn apply_policy(
        &self,
        device: DeviceId,
        target: PolicyTarget,
        _permanent: bool,
    ) -> Result<Option<u32>, PolicyError> {
        self.calls.lock().unwrap().push((device, target));
        Ok(None)
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// Locator that succeeds from the `succeed_on`-th call onwards.
pub struct ScriptedLocator {
    pub succeed_on: Option<u32>,
    pub calls: AtomicU32,
    on_first_call: Mutex<Option<Hook>>,
}

impl ScriptedLocator {
    pub fn new(succeed_on: Option<u32>) -> Self {
        Self {
            succeed_on,
            calls: AtomicU32::new(0),
            on_first_call: Mutex::new(None),
        }
    }

    /// Run `hook` during the first locate call, while certification is in progress.
    pub fn set_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_first_call.lock().unwrap() = Some(Box::new(hook));
    }
}

impl SignatureLocator for ScriptedLocator {
    fn locate(&self, _vendor: &str, _product: &str) -> Option<PathBuf> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = self.on_first_call.lock().unwrap().take() {
            hook();
        }
        match self.succeed_on {
            Some(k) if n >= k => Some(PathBuf::from("/dev/sdb2")),
            _ => None,
        }
    }
}

pub struct StaticReader;

impl CertificateReader for StaticReader {
    fn read(&self, _path: &Path) -> io::Result<Vec<u8>> {
        Ok(CERT_PEM.to_vec())
    }
}

pub struct CountingVerifier {
    pub answer: bool,
    pub calls: AtomicU32,
}

impl CertificateVerifier for CountingVerifier {
    fn verify(&self, certificate: &[u8], _trust_anchor: &Path) -> Result<bool, VerifierError> {
        assert_eq!(certificate, CERT_PEM);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer)
    }
}

/// Knobs for [`Harness::new`].
pub struct HarnessOptions {
    pub locator_succeeds_on: Option<u32>,
    pub verifier_answer: bool,
    pub retry_count: u32,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            locator_succeeds_on: Some(1),
            verifier_answer: true,
            retry_count: 5,
        }
    }
}

/// Engine plus inspectable collaborators, driven from the test thread.
pub struct Harness {
    pub engine: FsmEngine,
    pub registry: Arc<DeviceRegistry>,
    pub queue: Arc<EventQueue>,
    pub classifier: Arc<CountingClassifier>,
    pub enforcer: Arc<RecordingEnforcer>,
    pub locator: Arc<ScriptedLocator>,
    pub verifier: Arc<CountingVerifier>,
}

impl Harness {
    pub fn new(options: HarnessOptions) -> Self {
        Self::with_table(options, TransitionTable::standard())
    }

    pub fn with_table(options: HarnessOptions, table: TransitionTable) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let queue = Arc::new(EventQueue::new(32).unwrap());
        let classifier = Arc::new(CountingClassifier::default());
        let enforcer = Arc::new(RecordingEnforcer::default());
        let locator = Arc::new(ScriptedLocator::new(options.locator_succeeds_on));
        let verifier = Arc::new(CountingVerifier {
            answer: options.verifier_answer,
            calls: AtomicU32::new(0),
        });

        let policy = CertificationPolicy {
            trust_anchor: PathBuf::from("/etc/usb-access-control/ca.crt"),
            retry_count: options.retry_count,
            retry_delay: Duration::from_millis(1),
            allowed_prefixes: vec!["/dev/".into()],
            verify_timeout: Duration::from_secs(5),
        };
        let workflow = CertificateWorkflow::new(
            locator.clone(),
            Arc::new(StaticReader),
            verifier.clone(),
            policy,
        );
        let collaborators = Collaborators {
            classifier: classifier.clone(),
            enforcer: enforcer.clone(),
            workflow,
        };
        let retry = PolicyRetry {
            attempts: 1,
            delay: Duration::from_millis(1),
        };
        let engine = FsmEngine::with_table(
            table,
            Arc::clone(&registry),
            Arc::clone(&queue),
            collaborators,
            retry,
        );

        Self {
            engine,
            registry,
            queue,
            classifier,
            enforcer,
            locator,
            verifier,
        }
    }

    /// Register a device with the given properties.
    pub fn add_device(&self, id: u32, properties: &[(&str, &str)]) -> Arc<UsbDevice> {
        self.registry
            .add(UsbDevice::new(
                DeviceId::new(id).unwrap(),
                DeviceProperties::from_pairs(properties.iter().copied()),
            ))
            .unwrap()
    }

    /// Dispatch the next queued entry.
    pub fn step(&self) -> (UsbEvent, DispatchOutcome) {
        let entry = self.queue.dequeue();
        let event = entry.event();
        (event, self.engine.dispatch(entry))
    }

    /// Dispatch until the queue is empty, returning the events seen.
    pub fn drain(&self) -> Vec<UsbEvent> {
        let mut seen = Vec::new();
        while !self.queue.is_empty() {
            seen.push(self.step().0);
        }
        seen
    }

    pub fn enforcer_calls(&self) -> Vec<(DeviceId, PolicyTarget)> {
        self.enforcer.calls.lock().unwrap().clone()
    }

    pub fn classifier_calls(&self) -> u32 {
        self.classifier.calls.load(Ordering::SeqCst)
    }
}

pub fn storage_properties() -> [(&'static str, &'static str); 2] {
    [("type", "storage_device"), ("id", "0x048D:0x1234")]
}

pub fn non_storage_properties() -> [(&'static str, &'static str); 2] {
    [("type", "non_storage_device"), ("id", "046d:c52b")]
}
