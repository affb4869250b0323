//! Entity lookups for users, chats and channels.

use crate::client::{ChatRef, MessengerClient};
use crate::error::RetrievalError;
use crate::output::Emitter;
use crate::pipeline::Pipeline;
use crate::protocol::{RawObject, RawStruct};

const LOOKUP_KIND: &str = "EntityLookup";

/// Looks up every identifier and emits one record per input, in input order.
/// A failed lookup yields a record carrying the error instead of stopping the
/// rest. Returns the number of failed lookups.
pub async fn lookup_entities<C: MessengerClient + ?Sized>(
    client: &mut C,
    pipeline: &Pipeline,
    inputs: &[String],
    emitter: &mut Emitter,
) -> Result<usize, RetrievalError> {
    let mut failed = 0;
    for input in inputs {
        let lookup = match ChatRef::parse(input) {
            Ok(chat) => client.get_entity(&chat).await.map_err(|error| error.to_string()),
            Err(error) => Err(error.to_string()),
        };

        let record = RawStruct::new(LOOKUP_KIND).with("input", input.as_str());
        let record = match lookup {
            Ok(info) => record.with("entity", info.entity).with("full", info.full),
            Err(error) => {
                failed += 1;
                tracing::warn!(input = %input, %error, "entity lookup failed");
                record.with("error", error)
            }
        };
        emitter
            .emit(&pipeline.process_unfiltered(&RawObject::Object(record)))
            .await?;
    }
    Ok(failed)
}
