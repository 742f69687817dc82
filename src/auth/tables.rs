//! Identifier enums for the persisted layout (see `scripts/schema.sql`).

use sea_query::Iden;

#[derive(Iden)]
pub enum Sessions {
    Table,
    Id,
    UserId,
    Key,
    Hostip,
    Authtype,
    Master,
    Exclusive,
    Expired,
    Callnum,
    StartTime,
    UpdateTime,
}

#[derive(Iden)]
pub enum Users {
    Table,
    Id,
    Name,
    Password,
    Status,
    Usertype,
}

#[derive(Iden)]
pub enum UserKrbPrincipals {
    Table,
    UserId,
    KrbPrincipal,
}

#[derive(Iden)]
pub enum Permissions {
    Table,
    Id,
    Name,
}

#[derive(Iden)]
pub enum UserPerms {
    Table,
    UserId,
    PermId,
    Active,
}

#[derive(Iden)]
pub enum UserGroups {
    Table,
    UserId,
    GroupId,
    Active,
}

#[derive(Iden)]
pub enum Host {
    Table,
    Id,
    UserId,
}
