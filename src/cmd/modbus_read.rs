/* Raw register dump with an optional output-format mini-DSL.
 *
 * The DSL builds a runtime layout for the generic decoder:
 * `<type>[:<name>[:<unit>[:<multiplier>[:string]]]]`, comma-separated,
 * where <type> is byte/i8/u8/i16/u16/i32/u32, optionally prefixed with
 * `[N]` for a fixed-width array. `_` as a name omits the field; an
 * empty name becomes `Field_<index>`. A byte array with the trailing
 * `string` marker renders as ASCII. */

use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;

use crate::bms::read_with_timeout;
use crate::cmd::{DeviceFlags, hex_dump, parse_duration, write_record};
use crate::fields::{Endianness, FieldKind, FieldSpec, Layout, Scalar};
use crate::modbus::{Protocol, reader_for};

#[derive(Args, Debug)]
pub struct ModbusReadArgs {
    #[command(flatten)]
    pub device: DeviceFlags,

    /// Modbus device ID.
    #[arg(long, required = true)]
    pub id: u8,

    /// Start address of the first register to read.
    #[arg(long, required = true)]
    pub start: u16,

    /// Number of registers to read.
    #[arg(long, required = true)]
    pub count: u8,

    /// Timeout when reading from serial ports.
    #[arg(long, short = 't', default_value = "500ms", value_parser = parse_duration)]
    pub read_timeout: Duration,

    /// Wire protocol.
    #[arg(long, default_value = "ModbusRTU")]
    pub protocol: Protocol,

    /// Optional output format, e.g. "u16:voltage:V:0.01,[6]byte:serial:::string".
    #[arg(long = "format")]
    pub output_format: Option<String>,
}

pub async fn run(args: ModbusReadArgs) -> Result<()> {
    if args.id == 0 {
        bail!("id must be between 1 and 247");
    }
    if args.count > 125 {
        bail!("count must be <= 125");
    }
    let layout = args
        .output_format
        .as_deref()
        .map(parse_output_format)
        .transpose()?;

    let port = args.device.open().await?;
    let reader = reader_for(port.clone(), args.protocol, "")?;
    let data = read_with_timeout(reader.as_ref(), args.read_timeout, args.id, args.start, args.count)
        .await?;

    println!("{}:\n{}", args.device.address, hex_dump(&data));
    if let Some(layout) = layout {
        let record = layout.decode(&data, Endianness::Big)?;
        let mut stdout = std::io::stdout();
        write_record(&mut stdout, &record);
    }
    port.close().await;
    Ok(())
}

pub fn parse_output_format(format: &str) -> Result<Layout> {
    let mut fields = Vec::new();
    for (index, part) in format.split(',').enumerate() {
        let segments: Vec<&str> = part.split(':').collect();
        let type_spec = segments[0].trim();

        let (array_len, type_name) = match type_spec.strip_prefix('[') {
            Some(rest) => {
                let Some((len, name)) = rest.split_once(']') else {
                    bail!("invalid array type: '{type_spec}'");
                };
                let len: usize = len
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid array length: '{type_spec}'"))?;
                (Some(len), name)
            }
            None => (None, type_spec),
        };
        let scalar = match type_name {
            "byte" | "u8" => Scalar::U8,
            "i8" => Scalar::I8,
            "i16" => Scalar::I16,
            "u16" => Scalar::U16,
            "i32" => Scalar::I32,
            "u32" => Scalar::U32,
            _ => bail!("unknown field type: '{type_name}'"),
        };

        let raw_name = segments.get(1).map(|s| s.trim()).unwrap_or("");
        let skip = raw_name == "_";
        let mut name = if raw_name.is_empty() {
            format!("Field_{index}")
        } else {
            raw_name.to_string()
        };

        let as_string = segments.get(4).map(|s| s.trim()) == Some("string");
        let kind = match array_len {
            Some(len) if as_string && scalar == Scalar::U8 => FieldKind::Bytes { len },
            Some(len) => {
                if !name.contains("%d") {
                    name.push_str("_%d");
                }
                FieldKind::Array { elem: scalar, len }
            }
            None => FieldKind::Scalar(scalar),
        };

        let mut spec = FieldSpec::new(name, kind);
        if let Some(unit) = segments.get(2) {
            let unit = unit.trim();
            if !unit.is_empty() {
                spec = spec.unit(unit.to_string());
            }
        }
        if let Some(multiplier) = segments.get(3) {
            let multiplier = multiplier.trim();
            if !multiplier.is_empty() {
                let m: f64 = multiplier
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid multiplier: '{multiplier}'"))?;
                spec = spec.multiplier(m);
            }
        }
        if skip {
            spec = spec.skip();
        }
        fields.push(spec);
    }
    Ok(Layout::new(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::Value;

    #[test]
    fn dsl_scalars_and_defaults() {
        let layout = parse_output_format("u16:voltage:V:0.01,i16,u32:_").unwrap();
        assert_eq!(layout.fields.len(), 3);
        assert_eq!(layout.fields[0].name, "voltage");
        assert_eq!(layout.fields[0].unit, "V");
        assert_eq!(layout.fields[0].multiplier, Some(0.01));
        assert_eq!(layout.fields[1].name, "Field_1");
        assert!(layout.fields[2].skip);

        let record = layout
            .decode(&[0x14, 0xf6, 0x00, 0x78, 0, 0, 0, 5], Endianness::Big)
            .unwrap();
        let fields = record.fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].value, Value::Float(53.66));
        assert_eq!(fields[1].value, Value::Int(120));
    }

    #[test]
    fn dsl_byte_string_and_arrays() {
        let layout = parse_output_format("[5]byte:greeting:::string,[2]u16:cell").unwrap();
        let record = layout
            .decode(b"Hello\x0d\x1a\x0d\x19", Endianness::Big)
            .unwrap();
        let fields = record.fields();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].value, Value::Text("Hello".into()));
        assert_eq!(fields[1].info.name, "cell_1");
        assert_eq!(fields[1].value, Value::Uint(3354));
        assert_eq!(fields[2].info.name, "cell_2");
    }

    #[test]
    fn dsl_rejects_bad_input() {
        assert!(parse_output_format("f64:nope").is_err());
        assert!(parse_output_format("[x]u16:bad").is_err());
        assert!(parse_output_format("u16:v::abc").is_err());
    }
}
