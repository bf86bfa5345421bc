use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "bookings")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: Uuid,
    pub customer_id: Uuid,
    pub provider_id: Uuid,
    pub status: String,
    pub scheduled_start_at: DateTimeWithTimeZone,
    pub end_at: DateTimeWithTimeZone,
    pub subtotal: i64,
    pub fees: i64,
    pub discounts: i64,
    pub total_amount: i64,
    pub currency: String,
    pub address: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::CustomerId",
        to = "super::users::Column::Id"
    )]
    Customer,
    #[sea_orm(has_many = "super::booking_services::Entity")]
    BookingServices,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Customer.def()
    }
}

impl Related<super::booking_services::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BookingServices.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
