use async_trait::async_trait;
use sifen_autofix::config::{Environment, PatchConfig};
use sifen_autofix::error::{AppResult, ExitStatus, SigningError};
use sifen_autofix::models::{DocumentResult, InvoiceInput, LotResponse, ResultMessage, SendResponse};
use sifen_autofix::orchestrator::{AutofixOptions, AutofixRunner};
use sifen_autofix::services::artifact_store::{read_json, ArtifactStore, FINAL_STATE_FILE};
use sifen_autofix::services::de_builder::DeBuilder;
use sifen_autofix::services::packager::PackagedLot;
use sifen_autofix::services::signer::DocumentSigner;
use sifen_autofix::workflow::{FinalState, IterationCtx, LoopLimits};
use sifen_autofix::SifenTransport;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const INVOICE: &str = include_str!("fixtures/factura.toml");
const SUBEXE_MESSAGE: &str = "XML malformado: [El elemento esperado es: dSubExe en lugar de: dSubExo]";

/// 按脚本返回响应的传输，脚本用完后返回 `fallback_lot`
struct ScriptedTransport {
    sends: Mutex<VecDeque<SendResponse>>,
    lots: Mutex<VecDeque<LotResponse>>,
    fallback_lot: LotResponse,
    sent: Mutex<Vec<String>>,
    queries: AtomicUsize,
}

impl ScriptedTransport {
    fn new(lots: Vec<LotResponse>, fallback_lot: LotResponse) -> Self {
        Self {
            sends: Mutex::new(VecDeque::new()),
            lots: Mutex::new(lots.into()),
            fallback_lot,
            sent: Mutex::new(Vec::new()),
            queries: AtomicUsize::new(0),
        }
    }

    fn with_sends(self, sends: Vec<SendResponse>) -> Self {
        *self.sends.lock().unwrap() = sends.into();
        self
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SifenTransport for ScriptedTransport {
    async fn send_lot(&self, lot: &PackagedLot) -> AppResult<SendResponse> {
        self.sent.lock().unwrap().push(lot.lote_xml.clone());
        let scripted = self.sends.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| send_response("0300", Some("8800001"))))
    }

    async fn query_lot(&self, _protocol: &str) -> AppResult<LotResponse> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let scripted = self.lots.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| self.fallback_lot.clone()))
    }
}

/// 不改动 XML 的签名器，只记录调用次数
#[derive(Default)]
struct PassThroughSigner {
    calls: AtomicUsize,
}

#[async_trait]
impl DocumentSigner for PassThroughSigner {
    async fn sign(&self, xml: &str) -> Result<String, SigningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(xml.to_string())
    }
}

fn send_response(code: &str, protocol: Option<&str>) -> SendResponse {
    SendResponse {
        code: code.to_string(),
        message: "Lote recibido con éxito".to_string(),
        protocol: protocol.map(str::to_string),
        processing_time: None,
        processed_at: None,
    }
}

fn processing() -> LotResponse {
    LotResponse {
        code: "0361".to_string(),
        message: "Lote en procesamiento".to_string(),
        documents: vec![],
    }
}

fn concluded(status: &str, code: &str, message: &str) -> LotResponse {
    LotResponse {
        code: "0362".to_string(),
        message: "Procesamiento de lote concluido".to_string(),
        documents: vec![DocumentResult {
            cdc: "01800123457001001000004222024031511234567890".to_string(),
            status: status.to_string(),
            results: vec![ResultMessage {
                code: code.to_string(),
                message: message.to_string(),
            }],
        }],
    }
}

fn approved() -> LotResponse {
    concluded("Aprobado", "0260", "Autorización del DE satisfactoria")
}

/// 生成测试 DE，`drop_subexe` 时删除合计中的 `dSubExe`
fn write_invoice_xml(dir: &Path, drop_subexe: bool) -> PathBuf {
    let invoice: InvoiceInput = toml::from_str(INVOICE).unwrap();
    let mut built = DeBuilder::new().build(&invoice).unwrap();
    if drop_subexe {
        let totals = built.document.root.find_mut("gTotSub").unwrap();
        assert_eq!(totals.remove_children("dSubExe"), 1);
    }
    let path = dir.join("de.xml");
    std::fs::write(&path, built.document.to_xml_string().unwrap()).unwrap();
    path
}

async fn run(
    dir: &Path,
    xml: PathBuf,
    transport: &ScriptedTransport,
    signer: &PassThroughSigner,
    limits: LoopLimits,
) -> (ExitStatus, FinalState) {
    let store = ArtifactStore::new(dir.join("artifacts"), 0);
    let runner = AutofixRunner::new(transport, signer, store, PatchConfig::default());
    let options = AutofixOptions {
        xml: xml.clone(),
        limits,
        poll_every: Duration::ZERO,
    };
    let mut ctx = IterationCtx::new(Environment::Test, limits.max_iter, xml);
    let outcome = runner.run(&options, &mut ctx).await;

    let written: FinalState = read_json(&dir.join("artifacts").join(FINAL_STATE_FILE))
        .await
        .unwrap();
    assert_eq!(written, outcome.final_state);
    (outcome.exit, written)
}

const LIMITS: LoopLimits = LoopLimits {
    max_iter: 3,
    max_poll: 5,
};

#[tokio::test]
async fn test_processing_then_concluded_is_success() {
    let dir = tempfile::tempdir().unwrap();
    let xml = write_invoice_xml(dir.path(), false);
    let transport = ScriptedTransport::new(vec![processing(), processing(), approved()], processing());
    let signer = PassThroughSigner::default();

    let (exit, state) = run(dir.path(), xml, &transport, &signer, LIMITS).await;

    assert_eq!(exit, ExitStatus::Success);
    assert_eq!(state.outcome, "success");
    assert_eq!(state.approved, Some(1));
    assert_eq!(state.iterations, 1);
    assert_eq!(transport.queries.load(Ordering::SeqCst), 3);
    assert_eq!(signer.calls.load(Ordering::SeqCst), 1);

    let artifacts = dir.path().join("artifacts");
    assert!(artifacts.join("iter_001_sent.xml").exists());
    assert!(artifacts.join("iter_001_send_response.json").exists());
    assert!(artifacts.join("iter_001_lot_response.json").exists());
}

#[tokio::test]
async fn test_subexe_discrepancy_is_patched_and_resent() {
    let dir = tempfile::tempdir().unwrap();
    let xml = write_invoice_xml(dir.path(), true);
    let transport = ScriptedTransport::new(
        vec![concluded("Rechazado", "0160", SUBEXE_MESSAGE), approved()],
        processing(),
    );
    let signer = PassThroughSigner::default();

    let (exit, state) = run(dir.path(), xml, &transport, &signer, LIMITS).await;

    assert_eq!(exit, ExitStatus::Success);
    assert_eq!(state.iterations, 2);
    assert_eq!(state.patches.len(), 1);
    assert_eq!(state.patches[0].discrepancy.expected, "dSubExe");
    assert_eq!(state.patches[0].report.inserted, 1);
    // 补丁后重新签名
    assert_eq!(signer.calls.load(Ordering::SeqCst), 2);

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(!sent[0].contains("<dSubExe>"));
    let subexe = sent[1].find("<dSubExe>").unwrap();
    let subexo = sent[1].find("<dSubExo>").unwrap();
    assert!(subexe < subexo);
    assert_eq!(sent[1].matches("<dSubExe>").count(), 1);

    let artifacts = dir.path().join("artifacts");
    assert!(artifacts.join("iter_001_patched.xml").exists());
    assert!(artifacts.join("iter_002_sent.xml").exists());
}

#[tokio::test]
async fn test_poll_limit_exhausts_iterations() {
    let dir = tempfile::tempdir().unwrap();
    let xml = write_invoice_xml(dir.path(), false);
    let transport = ScriptedTransport::new(vec![], processing());
    let signer = PassThroughSigner::default();
    let limits = LoopLimits {
        max_iter: 2,
        max_poll: 2,
    };

    let (exit, state) = run(dir.path(), xml, &transport, &signer, limits).await;

    assert_eq!(exit, ExitStatus::MaxIterations);
    assert_eq!(state.exit_code, 7);
    assert_eq!(state.outcome, "max_iterations");
    assert_eq!(state.last_code.as_deref(), Some("0361"));
    assert_eq!(transport.sent().len(), 2);
    assert_eq!(transport.queries.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_ruc_not_enabled_is_business_blocked() {
    let dir = tempfile::tempdir().unwrap();
    let xml = write_invoice_xml(dir.path(), false);
    let transport = ScriptedTransport::new(
        vec![concluded(
            "Rechazado",
            "1264",
            "RUC no habilitado para facturación electrónica",
        )],
        processing(),
    );
    let signer = PassThroughSigner::default();

    let (exit, state) = run(dir.path(), xml, &transport, &signer, LIMITS).await;

    assert_eq!(exit, ExitStatus::Success);
    assert_eq!(state.exit_code, 0);
    assert_eq!(state.annotation.as_deref(), Some("business-blocked"));
    assert_eq!(state.last_code.as_deref(), Some("1264"));
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn test_unrecognized_0160_stops_with_message() {
    let dir = tempfile::tempdir().unwrap();
    let xml = write_invoice_xml(dir.path(), false);
    let message = "XML malformado: firma inválida";
    let transport =
        ScriptedTransport::new(vec![concluded("Rechazado", "0160", message)], processing());
    let signer = PassThroughSigner::default();

    let (exit, state) = run(dir.path(), xml, &transport, &signer, LIMITS).await;

    assert_eq!(exit, ExitStatus::Unrecognized0160);
    assert_eq!(state.last_message.as_deref(), Some(message));
    assert!(state.patches.is_empty());
}

#[tokio::test]
async fn test_repeated_discrepancy_exhausts_iterations() {
    let dir = tempfile::tempdir().unwrap();
    let xml = write_invoice_xml(dir.path(), true);
    let transport =
        ScriptedTransport::new(vec![], concluded("Rechazado", "0160", SUBEXE_MESSAGE));
    let signer = PassThroughSigner::default();
    let limits = LoopLimits {
        max_iter: 5,
        max_poll: 2,
    };

    let (exit, state) = run(dir.path(), xml, &transport, &signer, limits).await;

    assert_eq!(exit, ExitStatus::MaxIterations);
    assert_eq!(state.exit_code, 7);
    assert_eq!(state.outcome, "max_iterations");
    assert_eq!(state.iterations, 5);
    assert!(state.error.is_none());
    assert!(dir.path().join("artifacts").join(FINAL_STATE_FILE).exists());

    // 第一次补丁插入 dSubExe，之后的补丁都不改变文档
    assert_eq!(state.patches.len(), 5);
    assert_eq!(state.patches[0].report.inserted, 1);
    assert!(state.patches[1..].iter().all(|p| !p.report.changed()));
    // 只有改变过的文档需要重新签名
    assert_eq!(signer.calls.load(Ordering::SeqCst), 2);

    let sent = transport.sent();
    assert_eq!(sent.len(), 5);
    assert!(sent[1..].iter().all(|lote| lote.matches("<dSubExe>").count() == 1));
}

#[tokio::test]
async fn test_lot_not_queued_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let xml = write_invoice_xml(dir.path(), false);
    let transport = ScriptedTransport::new(vec![], processing())
        .with_sends(vec![send_response("0301", None)]);
    let signer = PassThroughSigner::default();

    let (exit, state) = run(dir.path(), xml, &transport, &signer, LIMITS).await;

    assert_eq!(exit, ExitStatus::Rejected);
    assert_eq!(state.outcome, "rejected");
    assert_eq!(transport.queries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_xml_still_writes_final_state() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new(vec![], processing());
    let signer = PassThroughSigner::default();

    let (exit, state) = run(
        dir.path(),
        dir.path().join("missing.xml"),
        &transport,
        &signer,
        LIMITS,
    )
    .await;

    assert_eq!(exit, ExitStatus::Config);
    assert_eq!(state.exit_code, 3);
    assert!(state.error.is_some());
    assert!(transport.sent().is_empty());
}
