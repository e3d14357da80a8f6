use chrono::NaiveDate;
use lopdf::{Dictionary, Document, Object, Stream};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ContractError, Result};

const PAGE_WIDTH: i64 = 595; // A4
const PAGE_HEIGHT: i64 = 842;
const MARGIN_LEFT: f64 = 72.0;
const TOP_Y: f64 = 770.0;
const BOTTOM_Y: f64 = 72.0;
const BODY_LEADING: f64 = 16.0;
const BODY_SIZE: f64 = 10.0;
// A new page is started rather than letting body text run into the
// signature block.
const SIGNATURE_BLOCK_CEILING: f64 = 220.0;

/// Where the visual signatures get stamped later, matching the rectangles
/// drawn on the final page. `(x, y, width, height)`, origin bottom-left.
pub const PARTNER_BOX: (f64, f64, f64, f64) = (200.0, 120.0, 200.0, 40.0);
pub const OFFICER_BOX: (f64, f64, f64, f64) = (200.0, 60.0, 200.0, 40.0);

/// Subject data as received from the caller. Optional fields are resolved once
/// into visible placeholders before rendering; an incomplete subject still
/// produces an inspectable document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectData {
    pub name: String,
    pub identity_document: Option<IdentityDocument>,
    pub address: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityDocument {
    pub kind: String,
    pub number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionTier {
    pub program: String,
    pub rate_percent: f64,
}

/// Commission schedule used when the caller does not parameterize one.
pub fn default_commission_table() -> Vec<CommissionTier> {
    vec![
        CommissionTier {
            program: "Máster".to_string(),
            rate_percent: 10.0,
        },
        CommissionTier {
            program: "Curso de especialización".to_string(),
            rate_percent: 8.0,
        },
        CommissionTier {
            program: "Certificación".to_string(),
            rate_percent: 5.0,
        },
    ]
}

const PLACEHOLDER: &str = "[pendiente]";

/// All optional lookups resolved once, up front.
struct ResolvedSubject {
    name: String,
    document: String,
    address: String,
    email: String,
}

impl ResolvedSubject {
    fn from(subject: &SubjectData) -> Self {
        let document = subject
            .identity_document
            .as_ref()
            .map(|d| format!("{} {}", d.kind, d.number))
            .unwrap_or_else(|| PLACEHOLDER.to_string());
        ResolvedSubject {
            name: if subject.name.trim().is_empty() {
                PLACEHOLDER.to_string()
            } else {
                subject.name.clone()
            },
            document,
            address: subject
                .address
                .clone()
                .unwrap_or_else(|| PLACEHOLDER.to_string()),
            email: subject
                .email
                .clone()
                .unwrap_or_else(|| PLACEHOLDER.to_string()),
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Renders the base contract document. Deterministic: identical subject data,
/// table and date produce byte-identical output.
pub fn render_contract(
    subject: &SubjectData,
    commission_table: &[CommissionTier],
    issued_on: NaiveDate,
) -> Result<Vec<u8>> {
    let resolved = ResolvedSubject::from(subject);
    let mut doc = Document::with_version("1.5");

    let mut pages_dict = Dictionary::new();
    pages_dict.set(b"Type", Object::Name(b"Pages".to_vec()));
    pages_dict.set(b"Kids", Object::Array(vec![]));
    pages_dict.set(b"Count", Object::Integer(0));
    let pages_id = doc.add_object(Object::Dictionary(pages_dict));

    let font_regular_id = add_base_font(&mut doc, b"Helvetica");
    let font_bold_id = add_base_font(&mut doc, b"Helvetica-Bold");

    let mut builder = ContractBuilder {
        pages: Vec::new(),
        current: PageContent::new(),
    };

    builder.heading("Contrato de Prescripción", 16.0);
    builder.blank(1.5);
    builder.line(&format!("Fecha: {}", issued_on.format("%Y-%m-%d")));
    builder.line(&format!("Prescriptor: {}", resolved.name));
    builder.line(&format!("Documento de identidad: {}", resolved.document));
    builder.line(&format!("Domicilio: {}", resolved.address));
    builder.line(&format!("Email: {}", resolved.email));
    builder.blank(1.5);

    for paragraph in clause_paragraphs() {
        builder.paragraph(paragraph);
        builder.blank(0.5);
    }

    builder.bold_line("Tabla de comisiones");
    builder.blank(0.5);
    for tier in commission_table {
        builder.line(&format!(
            "  {:<40} {:>6.2} %",
            tier.program, tier.rate_percent
        ));
    }
    builder.blank(1.0);
    builder.paragraph(
        "Las comisiones anteriores se devengan sobre el importe neto efectivamente \
         cobrado por la entidad y se liquidan conforme al calendario de liquidaciones vigente.",
    );

    builder.finish_with_signature_block();

    let mut page_ids = Vec::new();
    for page in &builder.pages {
        let content_id = doc.add_object(Object::Stream(Stream::new(
            Dictionary::new(),
            page.ops.clone(),
        )));

        let mut font_res = Dictionary::new();
        font_res.set(b"F1", Object::Reference(font_regular_id));
        font_res.set(b"F2", Object::Reference(font_bold_id));
        let mut resources = Dictionary::new();
        resources.set(b"Font", Object::Dictionary(font_res));

        let mut page_dict = Dictionary::new();
        page_dict.set(b"Type", Object::Name(b"Page".to_vec()));
        page_dict.set(b"Parent", Object::Reference(pages_id));
        page_dict.set(
            b"MediaBox",
            Object::Array(vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(PAGE_WIDTH),
                Object::Integer(PAGE_HEIGHT),
            ]),
        );
        page_dict.set(b"Resources", Object::Dictionary(resources));
        page_dict.set(b"Contents", Object::Reference(content_id));
        page_ids.push(Object::Reference(
            doc.add_object(Object::Dictionary(page_dict)),
        ));
    }

    let count = page_ids.len() as i64;
    let pages_obj = doc.get_object_mut(pages_id)?;
    let pages_dict = pages_obj
        .as_dict_mut()
        .map_err(|e| ContractError::RenderingFailed(format!("page tree root: {e}")))?;
    pages_dict.set(b"Kids", Object::Array(page_ids));
    pages_dict.set(b"Count", Object::Integer(count));

    let mut catalog = Dictionary::new();
    catalog.set(b"Type", Object::Name(b"Catalog".to_vec()));
    catalog.set(b"Pages", Object::Reference(pages_id));
    let catalog_id = doc.add_object(Object::Dictionary(catalog));
    doc.trailer.set("Root", Object::Reference(catalog_id));

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)
        .map_err(|e| ContractError::RenderingFailed(format!("save: {e}")))?;
    Ok(bytes)
}

fn add_base_font(doc: &mut Document, base_font: &[u8]) -> lopdf::ObjectId {
    let mut font = Dictionary::new();
    font.set(b"Type", Object::Name(b"Font".to_vec()));
    font.set(b"Subtype", Object::Name(b"Type1".to_vec()));
    font.set(b"BaseFont", Object::Name(base_font.to_vec()));
    font.set(b"Encoding", Object::Name(b"WinAnsiEncoding".to_vec()));
    doc.add_object(Object::Dictionary(font))
}

/// WinAnsi covers Latin-1; anything beyond it renders as '?'. Subject names in
/// the source system are Spanish-language Latin-1.
fn win_ansi_escaped(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        let code = c as u32;
        let byte = if code <= 0xFF { code as u8 } else { b'?' };
        match byte {
            b'(' | b')' | b'\\' => {
                out.push(b'\\');
                out.push(byte);
            }
            _ => out.push(byte),
        }
    }
    out
}

/// One page's content stream, built as raw operator bytes.
struct PageContent {
    ops: Vec<u8>,
    cursor_y: f64,
}

impl PageContent {
    fn new() -> Self {
        PageContent {
            ops: Vec::new(),
            cursor_y: TOP_Y,
        }
    }

    fn text_at(&mut self, font: &str, size: f64, x: f64, y: f64, text: &str) {
        self.ops
            .extend_from_slice(format!("BT /{font} {size:.1} Tf {x:.1} {y:.1} Td (").as_bytes());
        self.ops.extend_from_slice(&win_ansi_escaped(text));
        self.ops.extend_from_slice(b") Tj ET\n");
    }

    fn rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
        self.ops
            .extend_from_slice(format!("{x:.1} {y:.1} {w:.1} {h:.1} re S\n").as_bytes());
    }
}

struct ContractBuilder {
    pages: Vec<PageContent>,
    current: PageContent,
}

impl ContractBuilder {
    fn break_page(&mut self) {
        let finished = std::mem::replace(&mut self.current, PageContent::new());
        self.pages.push(finished);
    }

    fn ensure_room(&mut self, needed: f64) {
        if self.current.cursor_y - needed < BOTTOM_Y {
            self.break_page();
        }
    }

    fn heading(&mut self, text: &str, size: f64) {
        self.ensure_room(size * 2.0);
        let y = self.current.cursor_y;
        self.current.text_at("F2", size, MARGIN_LEFT, y, text);
        self.current.cursor_y -= size * 1.6;
    }

    fn bold_line(&mut self, text: &str) {
        self.ensure_room(BODY_LEADING);
        let y = self.current.cursor_y;
        self.current.text_at("F2", BODY_SIZE + 1.0, MARGIN_LEFT, y, text);
        self.current.cursor_y -= BODY_LEADING;
    }

    fn line(&mut self, text: &str) {
        self.ensure_room(BODY_LEADING);
        let y = self.current.cursor_y;
        self.current.text_at("F1", BODY_SIZE, MARGIN_LEFT, y, text);
        self.current.cursor_y -= BODY_LEADING;
    }

    fn blank(&mut self, lines: f64) {
        self.current.cursor_y -= BODY_LEADING * lines;
    }

    /// Fixed-column wrapping keeps pagination deterministic; clause text is
    /// static so glyph-accurate measurement is not needed here.
    fn paragraph(&mut self, text: &str) {
        const WRAP_COLUMNS: usize = 88;
        let mut line = String::new();
        for word in text.split_whitespace() {
            if !line.is_empty() && line.chars().count() + 1 + word.chars().count() > WRAP_COLUMNS {
                let done = std::mem::take(&mut line);
                self.line(&done);
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(word);
        }
        if !line.is_empty() {
            self.line(&line);
        }
    }

    /// The signature boxes always land on the last page, at the fixed
    /// coordinates the stampers target.
    fn finish_with_signature_block(&mut self) {
        if self.current.cursor_y < SIGNATURE_BLOCK_CEILING {
            self.break_page();
        }
        let (px, py, pw, ph) = PARTNER_BOX;
        let (ox, oy, ow, oh) = OFFICER_BOX;
        self.current
            .text_at("F1", BODY_SIZE, MARGIN_LEFT, py + 20.0, "Firma del Prescriptor:");
        self.current.rect(px, py, pw, ph);
        self.current
            .text_at("F1", BODY_SIZE, MARGIN_LEFT, oy + 20.0, "Firma del Presidente:");
        self.current.rect(ox, oy, ow, oh);
        self.break_page();
    }
}

fn clause_paragraphs() -> Vec<&'static str> {
    vec![
        "El presente contrato vincula al Prescriptor con la entidad y regula la actividad \
         de prescripción de programas formativos, las condiciones económicas aplicables y \
         las obligaciones de ambas partes.",
        "Cláusula 1 - Objeto del contrato. El Prescriptor se compromete a presentar a la \
         entidad candidatos interesados en los programas formativos incluidos en el anexo \
         vigente, sin capacidad de representación ni de contratación en nombre de la entidad.",
        "Cláusula 2 - Obligaciones. El Prescriptor actuará con diligencia y buena fe, \
         facilitando información veraz a los candidatos. La entidad pondrá a su disposición \
         el material informativo actualizado de cada programa.",
        "Cláusula 3 - Confidencialidad. Ambas partes se obligan a mantener la \
         confidencialidad sobre la información no pública a la que accedan con ocasión de \
         este contrato, obligación que subsiste tras su terminación.",
        "Cláusula 4 - Condiciones económicas. La entidad abonará al Prescriptor las \
         comisiones recogidas en la tabla siguiente, calculadas sobre matrículas \
         efectivamente formalizadas y cobradas.",
        "Cláusula 5 - Duración y terminación. El contrato tiene duración anual prorrogable \
         tácitamente, pudiendo cualquiera de las partes resolverlo con un preaviso de \
         treinta días naturales.",
        "Cláusula 6 - Protección de datos. Los datos personales de los candidatos se \
         tratarán conforme a la normativa vigente; el Prescriptor solo comunicará datos \
         contando con el consentimiento del interesado.",
    ]
}
