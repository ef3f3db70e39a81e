use sq_frame::Table;
use sq_join::{JoinType, join_tables};

use crate::args::{Args, configuration, field_names, syntax};
use crate::collab::SaveOptions;
use crate::directive::Invocation;
use crate::engine::Exec;
use crate::error::DirectiveError;

/// `lookup <name> <key...> [OUTPUT f1, f2]`: left-joins the stored table
/// on the keys, adding only the OUTPUT fields when given.
pub(crate) fn lookup(exec: &Exec<'_>, table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let split = inv
        .args
        .iter()
        .position(|token| token.is_keyword("output") || token.is_keyword("outputnew"));
    let (head, outputs) = match split {
        Some(at) => (&inv.args[..at], Some(field_names(&inv.args[at + 1..]))),
        None => (inv.args, None),
    };
    let names = field_names(head);
    let Some((name, keys)) = names.split_first() else {
        return Err(syntax("lookup", "expected a lookup name and key fields"));
    };
    if keys.is_empty() {
        return Err(syntax("lookup", "expected at least one key field"));
    }

    let stored = exec.lookups().load(name)?;
    let stored = match outputs {
        Some(outputs) if outputs.is_empty() => {
            return Err(syntax("lookup", "expected fields after OUTPUT"));
        }
        Some(outputs) => {
            let mut wanted = keys.to_vec();
            wanted.extend(outputs.into_iter().filter(|field| !keys.contains(field)));
            stored.select(&wanted)?
        }
        None => stored,
    };
    Ok(join_tables(&table, &stored, keys, JoinType::Left)?)
}

/// `inputlookup <name>`: the stored table replaces the working one.
pub(crate) fn inputlookup(exec: &Exec<'_>, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let args = Args::parse(inv.args);
    let name = lookup_name("inputlookup", &args)?;
    Ok(exec.lookups().load(&name)?)
}

/// `outputlookup [append=] [overwrite=] [override_if_empty=] <name>`.
/// Saves and passes the table through unchanged.
pub(crate) fn outputlookup(
    exec: &Exec<'_>,
    table: Table,
    inv: &Invocation<'_>,
) -> Result<Table, DirectiveError> {
    let args = Args::parse(inv.args);
    let append = args.flag("outputlookup", "append")?.unwrap_or(false);
    let overwrite = args.flag("outputlookup", "overwrite")?.unwrap_or(false);
    if append && overwrite {
        return Err(configuration(
            "outputlookup",
            "append and overwrite are mutually exclusive",
        ));
    }
    let options = SaveOptions {
        append,
        override_if_empty: args
            .flag("outputlookup", "override_if_empty")?
            .unwrap_or(true),
    };
    let name = lookup_name("outputlookup", &args)?;
    exec.lookups().save(&name, &table, options)?;
    Ok(table)
}

fn lookup_name(directive: &'static str, args: &Args) -> Result<String, DirectiveError> {
    if let Some(name) = args.option("filename") {
        return Ok(name.to_owned());
    }
    match args.names().as_slice() {
        [name] => Ok(name.clone()),
        _ => Err(syntax(directive, "expected one lookup name")),
    }
}
