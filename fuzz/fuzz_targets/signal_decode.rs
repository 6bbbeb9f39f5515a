//! Fuzz target for signal payload decoding.
//!
//! Builds message bodies of arbitrary shape and decodes them as every
//! signal the proxies subscribe to. Mismatches must surface as errors.

#![no_main]

use arbitrary::Arbitrary;
use avahi_dbus::bus::Payload;
use avahi_dbus::types::{RecordItem, ResolvedService, ServiceItem};
use libfuzzer_sys::fuzz_target;
use zbus::zvariant::{Structure, StructureBuilder};

#[derive(Arbitrary, Debug, Clone)]
enum Field {
    Int(i32),
    Uint(u32),
    Short(u16),
    Text(String),
    Bytes(Vec<u8>),
    Txt(Vec<Vec<u8>>),
}

fn body(fields: &[Field]) -> Option<Structure<'static>> {
    let mut builder = StructureBuilder::new();
    for field in fields.iter().cloned() {
        builder = match field {
            Field::Int(v) => builder.add_field(v),
            Field::Uint(v) => builder.add_field(v),
            Field::Short(v) => builder.add_field(v),
            Field::Text(v) => builder.add_field(v),
            Field::Bytes(v) => builder.add_field(v),
            Field::Txt(v) => builder.add_field(v),
        };
    }
    builder.build().ok()
}

fn payload(fields: &[Field]) -> Option<Payload> {
    body(fields).map(Payload::encode)
}

fuzz_target!(|fields: Vec<Field>| {
    if fields.is_empty() {
        return;
    }

    if let Some(p) = payload(&fields) {
        let _ = p
            .decode::<(i32, i32, String, u16, u16, Vec<u8>, u32)>()
            .and_then(RecordItem::try_from);
    }
    if let Some(p) = payload(&fields) {
        let _ = p
            .decode::<(i32, i32, String, String, String, u32)>()
            .and_then(ServiceItem::try_from);
    }
    if let Some(p) = payload(&fields) {
        let _ = p
            .decode::<(
                i32,
                i32,
                String,
                String,
                String,
                String,
                i32,
                String,
                u16,
                Vec<Vec<u8>>,
                u32,
            )>()
            .and_then(ResolvedService::try_from);
    }
    if let Some(p) = payload(&fields) {
        let _ = p.decode::<(i32, String)>();
    }
    if let Some(p) = payload(&fields) {
        let _ = p.decode::<(String,)>();
    }
});
