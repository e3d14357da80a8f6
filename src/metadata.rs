use chrono::{DateTime, Utc};
use lopdf::{Dictionary, Document, Object, Stream};

use crate::error::{ContractError, Result};

/// Descriptive metadata written into both channels: the legacy Info
/// dictionary and the XMP metadata stream. Both are produced from this one
/// value, so they cannot disagree.
#[derive(Debug, Clone)]
pub struct DocumentMetadata {
    pub title: String,
    pub author: String,
    pub subject: String,
    pub keywords: String,
    pub creator: String,
    pub producer: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

pub fn embed_metadata(source: &[u8], meta: &DocumentMetadata) -> Result<Vec<u8>> {
    let mut doc = Document::load_mem(source)
        .map_err(|e| ContractError::RenderingFailed(format!("source document load: {e}")))?;

    let mut info = Dictionary::new();
    info.set(b"Title", pdf_text(&meta.title));
    info.set(b"Author", pdf_text(&meta.author));
    info.set(b"Subject", pdf_text(&meta.subject));
    info.set(b"Keywords", pdf_text(&meta.keywords));
    info.set(b"Creator", pdf_text(&meta.creator));
    info.set(b"Producer", pdf_text(&meta.producer));
    info.set(b"CreationDate", pdf_date(&meta.created));
    info.set(b"ModDate", pdf_date(&meta.modified));
    let info_id = doc.add_object(Object::Dictionary(info));
    doc.trailer.set("Info", Object::Reference(info_id));

    let xmp = xmp_packet(meta);
    let mut xmp_dict = Dictionary::new();
    xmp_dict.set(b"Type", Object::Name(b"Metadata".to_vec()));
    xmp_dict.set(b"Subtype", Object::Name(b"XML".to_vec()));
    let xmp_id = doc.add_object(Object::Stream(Stream::new(xmp_dict, xmp.into_bytes())));

    let catalog_id = doc
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .map_err(|e| ContractError::RenderingFailed(format!("document catalog: {e}")))?;
    let catalog = doc
        .get_object_mut(catalog_id)
        .and_then(Object::as_dict_mut)
        .map_err(|e| ContractError::RenderingFailed(format!("document catalog: {e}")))?;
    catalog.set(b"Metadata", Object::Reference(xmp_id));

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| ContractError::RenderingFailed(format!("save: {e}")))?;
    Ok(out)
}

/// UTF-16BE with BOM, hex encoded, so titles and names survive beyond Latin-1.
fn pdf_text(text: &str) -> Object {
    let mut bytes = vec![0xFE, 0xFF];
    for unit in text.encode_utf16() {
        bytes.extend(unit.to_be_bytes());
    }
    Object::String(bytes, lopdf::StringFormat::Hexadecimal)
}

fn pdf_date(ts: &DateTime<Utc>) -> Object {
    let formatted = format!("D:{}+00'00'", ts.format("%Y%m%d%H%M%S"));
    Object::String(formatted.into_bytes(), lopdf::StringFormat::Literal)
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn xmp_packet(meta: &DocumentMetadata) -> String {
    let created = meta.created.format("%Y-%m-%dT%H:%M:%SZ");
    let modified = meta.modified.format("%Y-%m-%dT%H:%M:%SZ");
    format!(
        r#"<?xpacket begin="" id="W5M0MpCehiHzreSzNTczkc9d"?>
<x:xmpmeta xmlns:x="adobe:ns:meta/">
 <rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#">
  <rdf:Description rdf:about=""
    xmlns:dc="http://purl.org/dc/elements/1.1/"
    xmlns:xmp="http://ns.adobe.com/xap/1.0/"
    xmlns:pdf="http://ns.adobe.com/pdf/1.3/">
   <dc:title><rdf:Alt><rdf:li xml:lang="x-default">{title}</rdf:li></rdf:Alt></dc:title>
   <dc:creator><rdf:Seq><rdf:li>{author}</rdf:li></rdf:Seq></dc:creator>
   <dc:description><rdf:Alt><rdf:li xml:lang="x-default">{subject}</rdf:li></rdf:Alt></dc:description>
   <pdf:Keywords>{keywords}</pdf:Keywords>
   <pdf:Producer>{producer}</pdf:Producer>
   <xmp:CreatorTool>{creator}</xmp:CreatorTool>
   <xmp:CreateDate>{created}</xmp:CreateDate>
   <xmp:ModifyDate>{modified}</xmp:ModifyDate>
  </rdf:Description>
 </rdf:RDF>
</x:xmpmeta>
<?xpacket end="w"?>"#,
        title = xml_escape(&meta.title),
        author = xml_escape(&meta.author),
        subject = xml_escape(&meta.subject),
        keywords = xml_escape(&meta.keywords),
        producer = xml_escape(&meta.producer),
        creator = xml_escape(&meta.creator),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{default_commission_table, render_contract, SubjectData};
    use chrono::NaiveDate;

    fn meta() -> DocumentMetadata {
        let ts = DateTime::parse_from_rfc3339("2026-03-14T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        DocumentMetadata {
            title: "Contrato de Prescripción - Ana Gómez".to_string(),
            author: "SIGP".to_string(),
            subject: "Contrato de prescripción".to_string(),
            keywords: "contrato, prescriptor, firma".to_string(),
            creator: "sigp-contracts".to_string(),
            producer: "sigp-contracts".to_string(),
            created: ts,
            modified: ts,
        }
    }

    fn base_pdf() -> Vec<u8> {
        let subject = SubjectData {
            name: "Ana Gómez".to_string(),
            identity_document: None,
            address: None,
            email: None,
        };
        render_contract(
            &subject,
            &default_commission_table(),
            NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn info_dictionary_carries_all_fields() {
        let out = embed_metadata(&base_pdf(), &meta()).unwrap();
        let doc = Document::load_mem(&out).unwrap();
        let info_id = doc.trailer.get(b"Info").unwrap().as_reference().unwrap();
        let info = doc.get_object(info_id).unwrap().as_dict().unwrap();
        for key in [
            b"Title".as_slice(),
            b"Author",
            b"Subject",
            b"Keywords",
            b"Creator",
            b"Producer",
            b"CreationDate",
            b"ModDate",
        ] {
            assert!(info.has(key), "missing {}", String::from_utf8_lossy(key));
        }
        let expected = match pdf_text(&meta().title) {
            Object::String(bytes, _) => bytes,
            _ => unreachable!(),
        };
        match info.get(b"Title").unwrap() {
            Object::String(bytes, _) => assert_eq!(bytes, &expected),
            other => panic!("Title is not a string: {other:?}"),
        }
    }

    #[test]
    fn xmp_stream_agrees_with_info_dictionary() {
        let m = meta();
        let out = embed_metadata(&base_pdf(), &m).unwrap();
        let doc = Document::load_mem(&out).unwrap();
        let root_id = doc.trailer.get(b"Root").unwrap().as_reference().unwrap();
        let catalog = doc.get_object(root_id).unwrap().as_dict().unwrap();
        let xmp_id = catalog.get(b"Metadata").unwrap().as_reference().unwrap();
        let stream = doc.get_object(xmp_id).unwrap().as_stream().unwrap();
        let xml = String::from_utf8(stream.content.clone()).unwrap();
        assert!(xml.contains(&xml_escape(&m.title)));
        assert!(xml.contains(&xml_escape(&m.author)));
        assert!(xml.contains(&xml_escape(&m.producer)));
    }

    #[test]
    fn pdf_date_format() {
        let ts = DateTime::parse_from_rfc3339("2026-03-14T10:05:09Z")
            .unwrap()
            .with_timezone(&Utc);
        let obj = pdf_date(&ts);
        match obj {
            Object::String(bytes, _) => {
                assert_eq!(String::from_utf8(bytes).unwrap(), "D:20260314100509+00'00'")
            }
            _ => panic!("expected string"),
        }
    }
}
