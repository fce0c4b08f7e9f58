//! Mapping of CLR property types to protobuf field types.

use super::{Decompiler, ParseOptions};
use crate::error::Result;
use crate::metadata::CilType;
use crate::proto::{FieldType, Import, Scalar, TopLevelId, WellKnown};

const NULLABLE_NAME: &str = "Nullable`1";

impl Decompiler {
    /// Resolves `ty` as used by a field, request or response of `from`.
    ///
    /// Referenced messages and enums are reconstructed on demand and their
    /// files imported into the file of `from`.
    pub(super) fn resolve_field_type<T: CilType>(
        &mut self,
        ty: &T,
        from: TopLevelId,
        options: ParseOptions,
    ) -> Result<FieldType> {
        let arguments = ty.generic_type_arguments();

        if ty.name() == NULLABLE_NAME && ty.namespace() == Some("System") {
            if let Some(wrapper) = arguments
                .first()
                .and_then(|inner| WellKnown::wrapper_for_clr_name(inner.full_name()))
            {
                return Ok(self.well_known(wrapper, from));
            }
        }

        match arguments.as_slice() {
            [element] => {
                let element = self.resolve_field_type(element, from, options)?;
                return Ok(FieldType::Repeated(Box::new(element)));
            }
            [key, value] => {
                let key = self.resolve_field_type(key, from, options)?;
                let value = self.resolve_field_type(value, from, options)?;
                return Ok(FieldType::Map(Box::new(key), Box::new(value)));
            }
            _ => {}
        }

        if let Some(scalar) = Scalar::from_clr_name(ty.full_name()) {
            return Ok(FieldType::Scalar(scalar));
        }

        if let Some(wk) = WellKnown::from_clr_name(ty.full_name()) {
            return Ok(self.well_known(wk, from));
        }

        let target = if ty.is_enum() {
            if options.skip_enums {
                return Ok(FieldType::Scalar(Scalar::Int32));
            }
            self.parse_enum(ty, options)?
        } else {
            self.parse_message(ty, options)?
        };

        self.import_declaration(from, target);
        Ok(FieldType::Reference(target))
    }

    fn well_known(&mut self, wk: WellKnown, from: TopLevelId) -> FieldType {
        if let Some(file) = self.schema.top_level(from).file {
            self.schema.add_import(file, Import::WellKnown(wk.file));
        }
        FieldType::WellKnown(wk)
    }
}
