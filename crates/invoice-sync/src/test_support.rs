//! In-memory collaborators and fixtures for tests.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;

use crate::{
    AuditEntry, AuditLog, CfdiParser, ClientError, Collaborators, CreatedJob, DedupStore,
    DerivedAmounts, Direction, ExternalSyncClient, JobVerification, NaturalKey, Package,
    PackageStore, ParsedInvoice, RepositoryError, RequestId, RequestRepository, SaveOutcome,
    ServiceSettings, SubjectId, SyncRequest, SyncService, Throttle, WatermarkStore,
};
use crate::invoice::{Amount, InvoicePayload};

/// RFC every fixture document is issued by.
pub const SUBJECT: &str = "AAA010101AAA";

/// In-memory request records, kept in insertion order.
#[derive(Default)]
pub struct InMemoryRequests {
    records: Mutex<Vec<SyncRequest>>,
}

impl InMemoryRequests {
    pub fn stored(&self, id: &RequestId) -> Option<SyncRequest> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| &r.id == id)
            .cloned()
    }
}

#[async_trait::async_trait]
impl RequestRepository for InMemoryRequests {
    async fn create(&self, request: &SyncRequest) -> Result<(), RepositoryError> {
        self.records.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn create_within_quota(
        &self,
        request: &SyncRequest,
        limit: usize,
    ) -> Result<bool, RepositoryError> {
        let mut records = self.records.lock().unwrap();
        let in_flight = records
            .iter()
            .filter(|r| {
                r.subject_id == request.subject_id
                    && r.direction == request.direction
                    && !r.is_terminal()
            })
            .count();
        if in_flight >= limit {
            return Ok(false);
        }
        records.push(request.clone());
        Ok(true)
    }

    async fn get(&self, id: &RequestId) -> Result<Option<SyncRequest>, RepositoryError> {
        Ok(self.stored(id))
    }

    async fn update(&self, request: &SyncRequest) -> Result<(), RepositoryError> {
        let mut records = self.records.lock().unwrap();
        let slot = records
            .iter_mut()
            .find(|r| r.id == request.id)
            .ok_or_else(|| RepositoryError::NotFound(request.id.to_string()))?;
        *slot = request.clone();
        Ok(())
    }

    async fn list_for(
        &self,
        subject: &SubjectId,
        direction: Direction,
    ) -> Result<Vec<SyncRequest>, RepositoryError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| &r.subject_id == subject && r.direction == direction)
            .cloned()
            .collect())
    }

    async fn list(&self, subject: Option<&SubjectId>) -> Result<Vec<SyncRequest>, RepositoryError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| subject.is_none_or(|s| &r.subject_id == s))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryPackages {
    packages: Mutex<Vec<Package>>,
}

#[async_trait::async_trait]
impl PackageStore for InMemoryPackages {
    async fn save(&self, package: &Package) -> Result<(), RepositoryError> {
        let mut packages = self.packages.lock().unwrap();
        match packages.iter_mut().find(|p| {
            p.request_id == package.request_id && p.package_id == package.package_id
        }) {
            Some(existing) => *existing = package.clone(),
            None => packages.push(package.clone()),
        }
        Ok(())
    }

    async fn list_ids(&self, request_id: &RequestId) -> Result<Vec<String>, RepositoryError> {
        Ok(self
            .packages
            .lock()
            .unwrap()
            .iter()
            .filter(|p| &p.request_id == request_id)
            .map(|p| p.package_id.clone())
            .collect())
    }

    async fn load(&self, request_id: &RequestId) -> Result<Vec<Package>, RepositoryError> {
        Ok(self
            .packages
            .lock()
            .unwrap()
            .iter()
            .filter(|p| &p.request_id == request_id)
            .cloned()
            .collect())
    }
}

/// In-memory invoice store that can be told to fail manual edits.
#[derive(Default)]
pub struct InMemoryInvoices {
    invoices: Mutex<HashMap<(SubjectId, NaturalKey), ParsedInvoice>>,
    failing_edits: AtomicU32,
    edit_calls: AtomicUsize,
}

impl InMemoryInvoices {
    /// Make the next `n` calls to `apply_manual_edit` fail.
    pub fn fail_next_edits(&self, n: u32) {
        self.failing_edits.store(n, Ordering::SeqCst);
    }

    pub fn edit_calls(&self) -> usize {
        self.edit_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.invoices.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl DedupStore for InMemoryInvoices {
    async fn exists(&self, subject: &SubjectId, key: &NaturalKey) -> Result<bool, RepositoryError> {
        Ok(self
            .invoices
            .lock()
            .unwrap()
            .contains_key(&(subject.clone(), key.clone())))
    }

    async fn save(&self, invoice: &ParsedInvoice) -> Result<SaveOutcome, RepositoryError> {
        let mut invoices = self.invoices.lock().unwrap();
        let key = (invoice.subject_id.clone(), invoice.natural_key.clone());
        if invoices.contains_key(&key) {
            return Ok(SaveOutcome::AlreadyPresent);
        }
        invoices.insert(key, invoice.clone());
        Ok(SaveOutcome::Inserted)
    }

    async fn get(
        &self,
        subject: &SubjectId,
        key: &NaturalKey,
    ) -> Result<Option<ParsedInvoice>, RepositoryError> {
        Ok(self
            .invoices
            .lock()
            .unwrap()
            .get(&(subject.clone(), key.clone()))
            .cloned())
    }

    async fn apply_manual_edit(
        &self,
        subject: &SubjectId,
        key: &NaturalKey,
        derived: DerivedAmounts,
    ) -> Result<ParsedInvoice, RepositoryError> {
        self.edit_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_edits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(RepositoryError::Database("simulated write failure".into()));
        }

        let mut invoices = self.invoices.lock().unwrap();
        let invoice = invoices
            .get_mut(&(subject.clone(), key.clone()))
            .ok_or_else(|| RepositoryError::NotFound(key.to_string()))?;
        invoice.derived = derived;
        invoice.manually_modified = true;
        Ok(invoice.clone())
    }
}

#[derive(Default)]
pub struct InMemoryWatermarks {
    marks: Mutex<HashMap<(SubjectId, Direction), NaiveDate>>,
}

#[async_trait::async_trait]
impl WatermarkStore for InMemoryWatermarks {
    async fn get(
        &self,
        subject: &SubjectId,
        direction: Direction,
    ) -> Result<Option<NaiveDate>, RepositoryError> {
        Ok(self
            .marks
            .lock()
            .unwrap()
            .get(&(subject.clone(), direction))
            .copied())
    }

    async fn advance(
        &self,
        subject: &SubjectId,
        direction: Direction,
        date: NaiveDate,
    ) -> Result<NaiveDate, RepositoryError> {
        let mut marks = self.marks.lock().unwrap();
        let mark = marks.entry((subject.clone(), direction)).or_insert(date);
        *mark = (*mark).max(date);
        Ok(*mark)
    }
}

#[derive(Default)]
pub struct InMemoryAudit {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAudit {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl AuditLog for InMemoryAudit {
    async fn append(&self, entry: AuditEntry) -> Result<(), RepositoryError> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }

    async fn entries_for(&self, request_id: &RequestId) -> Result<Vec<AuditEntry>, RepositoryError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.request_id.as_ref() == Some(request_id))
            .cloned()
            .collect())
    }
}

/// Client answering from scripted queues.
///
/// Job creation succeeds with `JOB-<n>` unless an answer was pushed.
/// Verification without a pushed answer is a protocol error.
#[derive(Default)]
pub struct ScriptedClient {
    created: Mutex<VecDeque<Result<CreatedJob, ClientError>>>,
    verifications: Mutex<VecDeque<Result<JobVerification, ClientError>>>,
    packages: Mutex<HashMap<String, Result<Vec<u8>, ClientError>>>,
    create_calls: AtomicUsize,
    fetches: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn push_created(&self, answer: Result<CreatedJob, ClientError>) {
        self.created.lock().unwrap().push_back(answer);
    }

    pub fn push_verification(&self, answer: Result<JobVerification, ClientError>) {
        self.verifications.lock().unwrap().push_back(answer);
    }

    pub fn add_package(&self, package_id: &str, content: Vec<u8>) {
        self.packages
            .lock()
            .unwrap()
            .insert(package_id.to_owned(), Ok(content));
    }

    pub fn fail_package(&self, package_id: &str, error: ClientError) {
        self.packages
            .lock()
            .unwrap()
            .insert(package_id.to_owned(), Err(error));
    }

    /// Number of `create_job` calls so far.
    pub fn created_jobs(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Package ids fetched so far, in call order.
    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ExternalSyncClient for ScriptedClient {
    fn label(&self) -> &str {
        "scripted"
    }

    async fn create_job(
        &self,
        _subject: &SubjectId,
        _from: NaiveDate,
        _to: NaiveDate,
        _direction: Direction,
    ) -> Result<CreatedJob, ClientError> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.created
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(CreatedJob {
                    job_id: format!("JOB-{n}"),
                    raw_status: "1".into(),
                    package_ids: None,
                })
            })
    }

    async fn verify_job(
        &self,
        _subject: &SubjectId,
        job_id: &str,
    ) -> Result<JobVerification, ClientError> {
        self.verifications
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ClientError::Protocol(format!("no answer scripted for {job_id}"))))
    }

    async fn fetch_package(
        &self,
        _subject: &SubjectId,
        package_id: &str,
    ) -> Result<Vec<u8>, ClientError> {
        self.fetches.lock().unwrap().push(package_id.to_owned());
        self.packages
            .lock()
            .unwrap()
            .get(package_id)
            .cloned()
            .unwrap_or_else(|| Err(ClientError::Protocol(format!("unknown package {package_id}"))))
    }
}

pub fn verification(raw_status: &str, package_ids: Option<&[&str]>) -> JobVerification {
    JobVerification {
        raw_status: raw_status.to_owned(),
        package_ids: package_ids.map(|ids| ids.iter().map(|id| (*id).to_owned()).collect()),
        error: None,
    }
}

/// A stored invoice issued by `subject`.
pub fn invoice(subject: &str, key: &str) -> ParsedInvoice {
    ParsedInvoice {
        natural_key: NaturalKey::new(key),
        subject_id: SubjectId::new(subject),
        direction: Direction::Issued,
        payload: InvoicePayload {
            issuer_rfc: subject.to_owned(),
            issuer_name: Some("Acme & Hijos".into()),
            receiver_rfc: "XEXX010101000".into(),
            receiver_name: None,
            issued_at: NaiveDate::from_ymd_opt(2025, 1, 15)
                .and_then(|d| d.and_hms_opt(10, 30, 0))
                .unwrap(),
            document_type: "I".into(),
            currency: "MXN".into(),
            subtotal: Amount::from_cents(100_000),
            total: Amount::from_cents(116_000),
        },
        derived: DerivedAmounts {
            transferred_taxes: Amount::from_cents(16_000),
            withheld_taxes: Amount::ZERO,
        },
        manually_modified: false,
    }
}

/// Build a gzip-compressed tar archive from `(name, content)` pairs.
pub fn build_package(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (name, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *content)
            .expect("append tar entry");
    }

    let mut encoder = builder.into_inner().expect("finish tar");
    encoder.flush().expect("flush gzip");
    encoder.finish().expect("finish gzip")
}

/// Attributes of a generated CFDI 4.0 document. Text is XML-escaped.
#[derive(Debug, Clone)]
pub struct CfdiFixture {
    pub uuid: String,
    pub issuer_rfc: String,
    pub issuer_name: String,
    pub receiver_rfc: String,
    pub receiver_name: String,
    pub issued_at: String,
    pub subtotal: String,
    pub total: String,
    pub transferred: String,
}

impl CfdiFixture {
    /// A document issued by [`SUBJECT`].
    pub fn issued(uuid: &str) -> Self {
        Self {
            uuid: uuid.to_owned(),
            issuer_rfc: SUBJECT.to_owned(),
            issuer_name: "Acme &amp; Hijos".to_owned(),
            receiver_rfc: "XEXX010101000".to_owned(),
            receiver_name: "Cliente Extranjero".to_owned(),
            issued_at: "2025-01-15T10:30:00".to_owned(),
            subtotal: "1000.00".to_owned(),
            total: "1160.00".to_owned(),
            transferred: "160.00".to_owned(),
        }
    }
}

pub fn cfdi_document(fixture: &CfdiFixture) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<cfdi:Comprobante xmlns:cfdi="http://www.sat.gob.mx/cfd/4" xmlns:tfd="http://www.sat.gob.mx/TimbreFiscalDigital" Version="4.0" Fecha="{issued_at}" SubTotal="{subtotal}" Total="{total}" Moneda="MXN" TipoDeComprobante="I" Exportacion="01" LugarExpedicion="06000">
  <cfdi:Emisor Rfc="{issuer_rfc}" Nombre="{issuer_name}" RegimenFiscal="601"/>
  <cfdi:Receptor Rfc="{receiver_rfc}" Nombre="{receiver_name}" UsoCFDI="G03"/>
  <cfdi:Conceptos>
    <cfdi:Concepto ClaveProdServ="84111506" Cantidad="1" Descripcion="Servicios" ValorUnitario="{subtotal}" Importe="{subtotal}" ObjetoImp="02">
      <cfdi:Impuestos>
        <cfdi:Traslados>
          <cfdi:Traslado Base="{subtotal}" Impuesto="002" TipoFactor="Tasa" TasaOCuota="0.160000" Importe="{transferred}"/>
        </cfdi:Traslados>
      </cfdi:Impuestos>
    </cfdi:Concepto>
  </cfdi:Conceptos>
  <cfdi:Impuestos TotalImpuestosTrasladados="{transferred}">
    <cfdi:Traslados>
      <cfdi:Traslado Base="{subtotal}" Impuesto="002" TipoFactor="Tasa" TasaOCuota="0.160000" Importe="{transferred}"/>
    </cfdi:Traslados>
  </cfdi:Impuestos>
  <cfdi:Complemento>
    <tfd:TimbreFiscalDigital Version="1.1" UUID="{uuid}" FechaTimbrado="{issued_at}"/>
  </cfdi:Complemento>
</cfdi:Comprobante>
"#,
        issued_at = fixture.issued_at,
        subtotal = fixture.subtotal,
        total = fixture.total,
        issuer_rfc = fixture.issuer_rfc,
        issuer_name = fixture.issuer_name,
        receiver_rfc = fixture.receiver_rfc,
        receiver_name = fixture.receiver_name,
        transferred = fixture.transferred,
        uuid = fixture.uuid,
    )
}

/// In-memory collaborators wired together, with shortcuts for putting a
/// request into a given pipeline state.
pub struct Harness {
    pub client: Arc<ScriptedClient>,
    pub requests: Arc<InMemoryRequests>,
    pub packages: Arc<InMemoryPackages>,
    pub invoices: Arc<InMemoryInvoices>,
    pub watermarks: Arc<InMemoryWatermarks>,
    pub audit: Arc<InMemoryAudit>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self {
            client: Arc::new(ScriptedClient::default()),
            requests: Arc::new(InMemoryRequests::default()),
            packages: Arc::new(InMemoryPackages::default()),
            invoices: Arc::new(InMemoryInvoices::default()),
            watermarks: Arc::new(InMemoryWatermarks::default()),
            audit: Arc::new(InMemoryAudit::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            client: self.client.clone(),
            requests: self.requests.clone(),
            packages: self.packages.clone(),
            invoices: self.invoices.clone(),
            watermarks: self.watermarks.clone(),
            audit: self.audit.clone(),
            parser: Arc::new(CfdiParser),
        }
    }

    pub fn service(&self) -> SyncService {
        SyncService::new(
            self.collaborators(),
            ServiceSettings::default(),
            Throttle::unlimited(),
        )
    }

    /// A reservation the provider never answered.
    pub async fn reserved_request(&self) -> SyncRequest {
        let request = SyncRequest::new(
            SubjectId::new(SUBJECT),
            Direction::Issued,
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            Utc::now(),
        );
        self.requests.create(&request).await.unwrap();
        request
    }

    /// A request accepted by the provider as `job_id`.
    pub async fn created_request(&self, job_id: &str) -> SyncRequest {
        let mut request = self.reserved_request().await;
        request.external_job_id = Some(job_id.to_owned());
        request.raw_status = "1".into();
        self.requests.update(&request).await.unwrap();
        request
    }

    /// A verified request with the given packages.
    pub async fn ready_request(&self, package_ids: &[&str]) -> SyncRequest {
        let mut request = self.created_request("JOB-1").await;
        request.raw_status = "3".into();
        request.completed = true;
        request.package_ids = Some(package_ids.iter().map(|id| (*id).to_owned()).collect());
        self.requests.update(&request).await.unwrap();
        request
    }

    /// A request whose packages are already stored.
    pub async fn downloaded_request(&self, packages: &[(&str, Vec<u8>)]) -> SyncRequest {
        let ids: Vec<&str> = packages.iter().map(|(id, _)| *id).collect();
        let mut request = self.ready_request(&ids).await;

        for (package_id, content) in packages {
            self.packages
                .save(&Package {
                    package_id: (*package_id).to_owned(),
                    request_id: request.id.clone(),
                    content: content.clone(),
                    downloaded_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        request.packages_downloaded = true;
        request.timestamps.downloaded_at = Some(Utc::now());
        self.requests.update(&request).await.unwrap();
        request
    }
}
