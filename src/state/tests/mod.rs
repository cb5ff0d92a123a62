mod locks;
mod oplocks;
mod record;
